//! Tiered Extraction Pipeline (component I): regex tier, then escalation to
//! local and cloud LLM providers for uncertain or content-rich signals.

pub mod pipeline;
pub mod provider;
pub mod tier1;

pub use pipeline::{extract, merge};
pub use provider::ExtractionProvider;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of signal types the pipeline recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Task,
    Commitment,
    Deadline,
    Meeting,
    Contact,
    Reminder,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Task => "task",
            ItemType::Commitment => "commitment",
            ItemType::Deadline => "deadline",
            ItemType::Meeting => "meeting",
            ItemType::Contact => "contact",
            ItemType::Reminder => "reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(ItemType::Task),
            "commitment" => Some(ItemType::Commitment),
            "deadline" => Some(ItemType::Deadline),
            "meeting" => Some(ItemType::Meeting),
            "contact" => Some(ItemType::Contact),
            "reminder" => Some(ItemType::Reminder),
            _ => None,
        }
    }
}

/// A message (or equivalent signal source) observed by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub source: String,
    pub source_id: String,
    pub user_id: String,
    pub author: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub conversation_history: Vec<String>,
}

/// A candidate fact pulled from an [`ObservationEvent`]. `extraction_tier`
/// is always `>=` the tier of the function that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub item_type: ItemType,
    pub content: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub source_event: String,
    pub extraction_tier: u8,
}
