//! Line commands for driving a runtime from stdin.

use thiserror::Error;

use stockwise_core::{InventoryError, OrderId, ProductId};
use stockwise_events::{BusMessage, EventBus, channels};
use stockwise_infra::InventoryRuntime;
use stockwise_inventory::AdjustmentReason;
use stockwise_orders::OrderItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Product { min_threshold: i64, quantity: i64 },
    Adjust { product_id: ProductId, delta: i64 },
    Stock(ProductId),
    Order { order_id: OrderId, items: Vec<OrderItem> },
    Compensate(OrderId),
    Replenish,
    Stats,
    Maintenance,
    /// Raw JSON for the order-events channel.
    Publish(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid {what} `{value}`")]
    Invalid { what: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if line.starts_with('{') {
        return Ok(Some(Command::Publish(line.to_string())));
    }

    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match name {
        "product" => match args.as_slice() {
            [min, qty] => Command::Product {
                min_threshold: number("min threshold", min)?,
                quantity: number("quantity", qty)?,
            },
            _ => return Err(ParseError::Usage("product <minThreshold> <quantity>")),
        },
        "adjust" => match args.as_slice() {
            [product, delta] => Command::Adjust {
                product_id: product_id(product)?,
                delta: number("delta", delta)?,
            },
            _ => return Err(ParseError::Usage("adjust <productId> <delta>")),
        },
        "stock" => match args.as_slice() {
            [product] => Command::Stock(product_id(product)?),
            _ => return Err(ParseError::Usage("stock <productId>")),
        },
        "order" => match args.as_slice() {
            [order, items @ ..] if !items.is_empty() => Command::Order {
                order_id: OrderId::new(*order),
                items: items.iter().copied().map(item).collect::<Result<_, _>>()?,
            },
            _ => return Err(ParseError::Usage("order <orderId> <productId>:<qty>...")),
        },
        "compensate" => match args.as_slice() {
            [order] => Command::Compensate(OrderId::new(*order)),
            _ => return Err(ParseError::Usage("compensate <orderId>")),
        },
        "replenish" => Command::Replenish,
        "stats" => Command::Stats,
        "maintenance" => Command::Maintenance,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn number(what: &'static str, value: &str) -> Result<i64, ParseError> {
    value.parse().map_err(|_| ParseError::Invalid {
        what,
        value: value.to_string(),
    })
}

fn product_id(value: &str) -> Result<ProductId, ParseError> {
    value.parse().map_err(|_| ParseError::Invalid {
        what: "product id",
        value: value.to_string(),
    })
}

fn item(value: &str) -> Result<OrderItem, ParseError> {
    let (product, qty) = value.split_once(':').ok_or_else(|| ParseError::Invalid {
        what: "item",
        value: value.to_string(),
    })?;
    Ok(OrderItem::new(product_id(product)?, number("quantity", qty)?))
}

/// Run a command and describe the result in one line.
pub fn execute<B>(runtime: &InventoryRuntime<B>, bus: &B, command: Command) -> Result<String, CommandError>
where
    B: EventBus<BusMessage> + Clone + 'static,
{
    let out = match command {
        Command::Product {
            min_threshold,
            quantity,
        } => {
            let product_id = ProductId::new();
            let record = runtime
                .ledger()
                .register_product(product_id, min_threshold, quantity)?;
            format!("{} quantity={} min={}", product_id, record.quantity(), record.min_threshold())
        }
        Command::Adjust { product_id, delta } => {
            let quantity = runtime.ledger().adjust(product_id, delta, AdjustmentReason::Manual)?;
            format!("{product_id} quantity={quantity}")
        }
        Command::Stock(product_id) => {
            let record = runtime.ledger().get_record(product_id)?;
            format!(
                "{product_id} quantity={} min={} below_min={}",
                record.quantity(),
                record.min_threshold(),
                record.is_below_min_threshold()
            )
        }
        Command::Order { order_id, items } => {
            let outcome = runtime.saga().process_order_saga(order_id.clone(), items)?;
            format!("{order_id} {}", outcome.status())
        }
        Command::Compensate(order_id) => {
            let status = runtime.saga().compensate_order(&order_id)?;
            format!("{order_id} {status}")
        }
        Command::Replenish => {
            let report = runtime.scheduler().run_once()?;
            format!(
                "scanned={} ordered={} skipped={} failed={}",
                report.scanned,
                report.ordered.len(),
                report.skipped,
                report.failed.len()
            )
        }
        Command::Stats => serde_json::to_string(&runtime.saga().order_stats()?)?,
        Command::Maintenance => {
            let report = runtime.run_maintenance()?;
            format!(
                "outbox_published={} outbox_pending={} compensations_completed={} compensations_pending={} \
                 replenishments_settled={} pruned={}",
                report.outbox.published,
                report.outbox.pending,
                report.compensations.completed,
                report.compensations.still_pending,
                report.replenishments_settled,
                report.pruned_events
            )
        }
        Command::Publish(payload) => {
            bus.publish(BusMessage::raw(channels::ORDER_EVENTS, None, payload))
                .map_err(|e| CommandError::Publish(e.to_string()))?;
            "published".to_string()
        }
    };
    Ok(out)
}
