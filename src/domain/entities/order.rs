use crate::domain::entities::exchange::Instrument;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    #[serde(rename = "INTRADAY")]
    Intraday,
    #[serde(rename = "DELIVERY")]
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variety {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "STOPLOSS")]
    StopLoss,
}

/// Order as the engine asks the broker to place it
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: Instrument,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub product: ProductType,
    pub variety: Variety,
    pub quantity: u32,
    pub price: Option<f64>,
    pub tag: Option<String>,
}

impl OrderRequest {
    /// Intraday market order, the engine's default for entries and exits
    pub fn market(instrument: Instrument, side: OrderSide, quantity: u32) -> Self {
        Self {
            instrument,
            side,
            order_type: OrderType::Market,
            product: ProductType::Intraday,
            variety: Variety::Normal,
            quantity,
            price: None,
            tag: None,
        }
    }

    pub fn limit(instrument: Instrument, side: OrderSide, quantity: u32, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(instrument, side, quantity)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.quantity == 0 {
            return Err("Order quantity must be positive".to_string());
        }
        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err("Limit orders must have a price".to_string()),
            (OrderType::Limit, Some(p)) if !(p.is_finite() && p > 0.0) => {
                Err(format!("Invalid limit price: {}", p))
            }
            _ => Ok(()),
        }
    }
}

/// Identifiers the broker returns for an accepted order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub unique_order_id: String,
}

/// Lifecycle status of a placed order
#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatus {
    Pending,
    Open,
    Complete { average_price: f64, filled_quantity: u32 },
    Rejected { reason: String },
    /// `filled_quantity` is non-zero when part of the order executed first
    Cancelled { filled_quantity: u32, average_price: f64 },
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Complete { .. } | OrderStatus::Rejected { .. } | OrderStatus::Cancelled { .. }
        )
    }

    /// Price and quantity that actually executed, full or partial
    pub fn fill(&self) -> Option<(f64, u32)> {
        match *self {
            OrderStatus::Complete {
                average_price,
                filled_quantity,
            }
            | OrderStatus::Cancelled {
                filled_quantity,
                average_price,
            } if filled_quantity > 0 => Some((average_price, filled_quantity)),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Open => write!(f, "OPEN"),
            OrderStatus::Complete { .. } => write!(f, "COMPLETE"),
            OrderStatus::Rejected { .. } => write!(f, "REJECTED"),
            OrderStatus::Cancelled { .. } => write!(f, "CANCELLED"),
        }
    }
}
