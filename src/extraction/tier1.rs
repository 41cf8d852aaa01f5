//! Tier 1: a fixed library of pre-compiled regex patterns. Cheap, no
//! external calls, at most one item of each [`ItemType`] per message.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::extraction::{ExtractedItem, ItemType, ObservationEvent};

struct PatternSet {
    todo_marker: Regex,
    task_verb: Regex,
    commitment: Regex,
    date_like: Regex,
    deadline: Regex,
    meeting: Regex,
    email: Regex,
    reminder: Regex,
}

fn patterns() -> &'static PatternSet {
    static PATTERNS: OnceLock<PatternSet> = OnceLock::new();
    PATTERNS.get_or_init(|| PatternSet {
        todo_marker: Regex::new(r"(?i)\bTODO\s*:").unwrap(),
        task_verb: Regex::new(r"(?i)\b(need to|have to|should|must|gotta)\b").unwrap(),
        commitment: Regex::new(r"(?i)\b(i'll|i will|i promise|i commit to)\b").unwrap(),
        date_like: Regex::new(r"(?i)\b(\d{1,2}/\d{1,2}(/\d{2,4})?|monday|tuesday|wednesday|thursday|friday|saturday|sunday|tomorrow|tonight|next week)\b").unwrap(),
        deadline: Regex::new(r"(?i)\b(by|due|deadline)\b").unwrap(),
        meeting: Regex::new(r"(?i)\b(meet|meeting|sync|call|schedule a)\b").unwrap(),
        email: Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap(),
        reminder: Regex::new(r"(?i)\bremind (me|him|her|them)\b").unwrap(),
    })
}

/// Run the fixed pattern library over one message. At most one
/// [`ExtractedItem`] is produced per [`ItemType`].
pub fn extract(event: &ObservationEvent) -> Vec<ExtractedItem> {
    let p = patterns();
    let content = &event.content;
    let has_date = p.date_like.is_match(content);
    let mut items = Vec::new();

    if p.todo_marker.is_match(content) {
        items.push(item(ItemType::Task, content, 0.85, event));
    } else if p.task_verb.is_match(content) {
        let confidence = if has_date { 0.75 } else { 0.55 };
        items.push(item(ItemType::Task, content, confidence, event));
    }

    if p.commitment.is_match(content) {
        let confidence = if has_date { 0.75 } else { 0.6 };
        items.push(item(ItemType::Commitment, content, confidence, event));
    }

    if p.deadline.is_match(content) && has_date {
        items.push(item(ItemType::Deadline, content, 0.7, event));
    }

    if p.meeting.is_match(content) {
        let confidence = if has_date { 0.75 } else { 0.55 };
        items.push(item(ItemType::Meeting, content, confidence, event));
    }

    if p.email.is_match(content) {
        items.push(item(ItemType::Contact, content, 0.9, event));
    }

    if p.reminder.is_match(content) {
        items.push(item(ItemType::Reminder, content, 0.65, event));
    }

    items
}

fn item(item_type: ItemType, content: &str, confidence: f64, event: &ObservationEvent) -> ExtractedItem {
    ExtractedItem {
        item_type,
        content: content.to_string(),
        confidence,
        metadata: HashMap::new(),
        source_event: event.source_id.clone(),
        extraction_tier: 1,
    }
}
