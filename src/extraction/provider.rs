//! The LLM-escalation seam (tiers 2 and 3): a minimal trait so the
//! pipeline never depends on a specific vendor SDK.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::extraction::ObservationEvent;

/// One candidate as returned by a provider, before it is wrapped into an
/// [`crate::extraction::ExtractedItem`] with a tier label.
#[derive(Debug, Clone)]
pub struct RawItem {
    pub item_type: String,
    pub content: String,
    pub confidence: f64,
    pub metadata: HashMap<String, Value>,
}

/// Local (tier 2) and cloud (tier 3) LLM escalation share this contract.
/// A failing provider call is caught by the pipeline and treated as an
/// empty result, never as a pipeline failure.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(&self, event: &ObservationEvent) -> Result<Vec<RawItem>>;
}
