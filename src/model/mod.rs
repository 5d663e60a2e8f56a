pub mod order;

pub use order::{NewOrder, Order, OrderDraft, OrderPatch, OrderStatus, ValidationError};
