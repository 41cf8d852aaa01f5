//! Health Monitor: metrics collection (F), anomaly analysis (G), and
//! self-healing (H) over the same snapshot tree.

pub mod analyzer;
pub mod collector;
pub mod healer;

pub use analyzer::{analyze, generate_daily_report, AnalysisResult, Anomaly, AnomalySeverity, DailyHealthReport};
pub use collector::{MetricsCollector, MetricsSnapshot};
pub use healer::{HealingActionType, SelfHealer};
