//! Orchestration and merge logic for the three extraction tiers.

use std::collections::HashMap;

use tracing::warn;

use crate::extraction::provider::ExtractionProvider;
use crate::extraction::{tier1, ExtractedItem, ItemType, ObservationEvent};

const ESCALATION_LOW: f64 = 0.3;
const ESCALATION_HIGH: f64 = 0.6;
const MIN_CONTENT_LEN_FOR_ESCALATION: usize = 20;
const DISCARD_BELOW: f64 = 0.3;

fn needs_escalation(items: &[ExtractedItem], content_len: usize) -> bool {
    let has_uncertain = items
        .iter()
        .any(|i| i.confidence >= ESCALATION_LOW && i.confidence < ESCALATION_HIGH);
    let has_nothing_but_rich_content = items.is_empty() && content_len >= MIN_CONTENT_LEN_FOR_ESCALATION;
    has_uncertain || has_nothing_but_rich_content
}

async fn escalate(
    provider: &dyn ExtractionProvider,
    event: &ObservationEvent,
    tier: u8,
) -> Vec<ExtractedItem> {
    let raw = match provider.extract(event).await {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, tier, "extraction provider call failed, treating as empty");
            return Vec::new();
        }
    };

    raw.into_iter()
        .filter_map(|raw_item| {
            let item_type = ItemType::parse(&raw_item.item_type)?;
            if raw_item.confidence < DISCARD_BELOW {
                return None;
            }
            Some(ExtractedItem {
                item_type,
                content: raw_item.content,
                confidence: raw_item.confidence,
                metadata: raw_item.metadata,
                source_event: event.source_id.clone(),
                extraction_tier: tier,
            })
        })
        .collect()
}

/// Run tier 1, escalate to tier 2 and (if still uncertain) tier 3, then merge.
pub async fn extract(
    event: &ObservationEvent,
    tier2: Option<&dyn ExtractionProvider>,
    tier3: Option<&dyn ExtractionProvider>,
) -> Vec<ExtractedItem> {
    let t1 = tier1::extract(event);
    let content_len = event.content.chars().count();

    let t2 = if needs_escalation(&t1, content_len) {
        match tier2 {
            Some(provider) => escalate(provider, event, 2).await,
            None => Vec::new(),
        }
    } else {
        Vec::new()
    };

    let merged_so_far = merge(&t1, &t2, None);
    let t3 = if needs_escalation(&merged_so_far, content_len) {
        match tier3 {
            Some(provider) => escalate(provider, event, 3).await,
            None => Vec::new(),
        }
    } else {
        Vec::new()
    };

    merge(&t1, &t2, Some(&t3))
}

fn prefix(content: &str, n: usize) -> String {
    content.chars().take(n).collect()
}

/// Merge tiers, keeping the highest-tier version of any duplicate content
/// and preserving the order of first occurrence within each type.
pub fn merge(t1: &[ExtractedItem], t2: &[ExtractedItem], t3: Option<&[ExtractedItem]>) -> Vec<ExtractedItem> {
    let combined: Vec<&ExtractedItem> = t1
        .iter()
        .chain(t2.iter())
        .chain(t3.into_iter().flatten())
        .collect();

    // Step 1: group by (item_type, content[:50]), keep the highest tier.
    let mut best: HashMap<(ItemType, String), (usize, &ExtractedItem)> = HashMap::new();
    let mut first_seen_order: Vec<(ItemType, String)> = Vec::new();

    for item in &combined {
        let key = (item.item_type, prefix(&item.content, 50));
        match best.get(&key) {
            Some((_, existing)) if existing.extraction_tier >= item.extraction_tier => {}
            Some(_) => {
                best.insert(key.clone(), (first_seen_order.iter().position(|k| *k == key).unwrap(), item));
            }
            None => {
                first_seen_order.push(key.clone());
                best.insert(key, (first_seen_order.len() - 1, item));
            }
        }
    }

    let mut deduped: Vec<&ExtractedItem> = first_seen_order
        .iter()
        .map(|key| best[key].1)
        .collect();
    deduped.sort_by_key(|item| {
        let key = (item.item_type, prefix(&item.content, 50));
        best[&key].0
    });

    // Step 2: drop items whose 30-char prefix matches an already-kept item
    // of equal-or-higher tier.
    let mut out: Vec<ExtractedItem> = Vec::new();
    for item in deduped {
        let short_key = (item.item_type, prefix(&item.content, 30));
        let redundant = out.iter().any(|kept| {
            (kept.item_type, prefix(&kept.content, 30)) == short_key && kept.extraction_tier >= item.extraction_tier
        });
        if !redundant {
            out.push(item.clone());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::extraction::provider::RawItem;
    use async_trait::async_trait;

    fn event(content: &str) -> ObservationEvent {
        ObservationEvent {
            source: "chat".to_string(),
            source_id: "evt-1".to_string(),
            user_id: "u1".to_string(),
            author: "alice".to_string(),
            content: content.to_string(),
            timestamp: "2026-07-27T00:00:00Z".to_string(),
            context: HashMap::new(),
            conversation_history: Vec::new(),
        }
    }

    fn mk(item_type: ItemType, content: &str, confidence: f64, tier: u8) -> ExtractedItem {
        ExtractedItem {
            item_type,
            content: content.to_string(),
            confidence,
            metadata: HashMap::new(),
            source_event: "evt-1".to_string(),
            extraction_tier: tier,
        }
    }

    #[test]
    fn merge_keeps_highest_tier_on_duplicate_content() {
        let t1 = vec![mk(ItemType::Meeting, "Let's sync about Q3", 0.55, 1)];
        let t2 = vec![mk(ItemType::Meeting, "Q3 sync proposed", 0.82, 2)];
        let merged = merge(&t1, &t2, None);
        // different content prefixes -> both kept, since step1 groups by exact 50-char prefix
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_collapses_exact_duplicate_text_across_tiers() {
        let t1 = vec![mk(ItemType::Task, "finish the report", 0.55, 1)];
        let t2 = vec![mk(ItemType::Task, "finish the report", 0.9, 2)];
        let merged = merge(&t1, &t2, None);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].extraction_tier, 2);
    }

    #[test]
    fn merge_drops_lower_tier_near_duplicate_by_30char_prefix() {
        let t1 = vec![mk(ItemType::Task, "finish the quarterly report today", 0.55, 1)];
        let t2 = vec![mk(ItemType::Task, "finish the quarterly report with charts", 0.8, 2)];
        let merged = merge(&t1, &t2, None);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].extraction_tier, 2);
    }

    #[test]
    fn merge_preserves_order_of_first_occurrence() {
        let t1 = vec![
            mk(ItemType::Task, "first task", 0.8, 1),
            mk(ItemType::Reminder, "second thing", 0.8, 1),
        ];
        let merged = merge(&t1, &[], None);
        assert_eq!(merged[0].content, "first task");
        assert_eq!(merged[1].content, "second thing");
    }

    struct StubProvider {
        items: Vec<RawItem>,
    }

    #[async_trait]
    impl ExtractionProvider for StubProvider {
        async fn extract(&self, _event: &ObservationEvent) -> Result<Vec<RawItem>> {
            Ok(self.items.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ExtractionProvider for FailingProvider {
        async fn extract(&self, _event: &ObservationEvent) -> Result<Vec<RawItem>> {
            Err(crate::error::AppError::CollaboratorUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn s4_escalation_scenario_prefers_tier2_meeting_item() {
        let tier2 = StubProvider {
            items: vec![RawItem {
                item_type: "meeting".to_string(),
                content: "Q3 sync proposed".to_string(),
                confidence: 0.82,
                metadata: HashMap::new(),
            }],
        };
        let event = event("Let's sync about Q3");
        let result = extract(&event, Some(&tier2), None).await;
        assert!(result.iter().any(|i| i.extraction_tier == 2 && i.content == "Q3 sync proposed"));
    }

    #[tokio::test]
    async fn failing_provider_degrades_to_empty_without_panicking() {
        let event = event("xyz not matching anything regex-wise but long enough to escalate");
        let result = extract(&event, Some(&FailingProvider), None).await;
        assert!(result.is_empty() || result.iter().all(|i| i.extraction_tier == 1));
    }

    #[tokio::test]
    async fn short_plain_message_does_not_escalate() {
        let event = event("hi");
        let result = extract(&event, None, None).await;
        assert!(result.is_empty());
    }
}
