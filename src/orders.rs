//! Order lifecycle payloads and the publish call boundary.
//!
//! The broker treats payloads as opaque JSON; these are the shapes the
//! room-service application actually pushes through it. Order-processing
//! code calls [`announce_created`] / [`announce_updated`] synchronously
//! after committing a state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels;
use crate::realtime::Broker;

/// Kitchen-side lifecycle of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Received,
    Preparing,
    Ready,
    Delivered,
}

impl OrderStatus {
    /// The next step in the fixed progression; `Delivered` is terminal.
    pub fn next(self) -> OrderStatus {
        match self {
            Self::Received => Self::Preparing,
            Self::Preparing => Self::Ready,
            Self::Ready => Self::Delivered,
            Self::Delivered => Self::Delivered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Delivered => "delivered",
        }
    }
}

/// One line of an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub menu_item_id: String,
    pub quantity: u32,
    /// Price in minor currency units at the time of ordering.
    pub unit_price: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customizations: Option<String>,
}

/// A room-service order as carried on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub room_number: String,
    pub status: OrderStatus,
    /// Sum of `unit_price * quantity` over the items, in minor units.
    pub total_amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Build a freshly received order, totalling the items.
    pub fn new(room_number: impl Into<String>, items: Vec<OrderItem>) -> Self {
        let total_amount = items
            .iter()
            .map(|it| it.unit_price * i64::from(it.quantity))
            .sum();
        Self {
            id: Uuid::new_v4().to_string(),
            room_number: room_number.into(),
            status: OrderStatus::Received,
            total_amount,
            special_instructions: None,
            created_at: Utc::now(),
            items,
        }
    }
}

/// Event published on the global `orders` channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderEvent {
    Created { order: Order },
    Updated { order: Order },
}

/// Event published on a per-order channel; carries only the status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: OrderStatus,
}

/// Announce a newly created order on all three channel families.
pub fn announce_created(broker: &Broker, order: &Order) {
    announce(broker, order, OrderEvent::Created { order: order.clone() });
}

/// Announce an order mutation (typically a status advance).
pub fn announce_updated(broker: &Broker, order: &Order) {
    announce(broker, order, OrderEvent::Updated { order: order.clone() });
}

fn announce(broker: &Broker, order: &Order, event: OrderEvent) {
    match serde_json::to_value(&event) {
        Ok(payload) => {
            broker.publish(channels::ORDERS, payload);
        }
        Err(err) => log::error!("failed to encode order event for {}: {}", order.id, err),
    }

    match serde_json::to_value(StatusEvent { status: order.status }) {
        Ok(payload) => {
            broker.publish(&channels::order(&order.id), payload);
        }
        Err(err) => log::error!("failed to encode status event for {}: {}", order.id, err),
    }

    match serde_json::to_value(&event) {
        Ok(mut payload) => {
            // Room streams see a uniform "order" envelope regardless of
            // create/update provenance.
            if let Some(map) = payload.as_object_mut() {
                map.insert("type".into(), serde_json::Value::String("order".into()));
            }
            broker.publish(&channels::room(&order.room_number), payload);
        }
        Err(err) => log::error!("failed to encode room event for {}: {}", order.id, err),
    }
}
