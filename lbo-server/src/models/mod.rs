//! Data models for the batch orchestrator

pub mod batch;
pub mod item;

pub use batch::{BatchView, StoreOutcome};
pub use item::{
    BoundingBox, Classification, ItemResult, ItemSource, PendingItem, SourceKind, WorkItem,
};
