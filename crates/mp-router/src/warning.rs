//! Warning Service — in-memory warning storage feeding the Monitoring &
//! Health component's `active_warnings`/`critical_warnings` counts and the
//! `/monitoring` HTTP endpoint, with an optional fan-out to an `AlertSink`
//! for out-of-band notification.
//!
//! Kept close to the teacher's `WarningService` (same storage shape,
//! cleanup, and acknowledgment model); only the category set and the
//! outbound notification type changed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mp_common::{Warning, WarningCategory, WarningSeverity};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::alert::AlertSink;

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    pub max_warning_age_hours: i64,
    pub max_warnings: usize,
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
            auto_acknowledge_hours: 8,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
    alert_sink: RwLock<Option<Arc<dyn AlertSink>>>,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
            alert_sink: RwLock::new(None),
        }
    }

    pub fn with_alert_sink(config: WarningServiceConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
            alert_sink: RwLock::new(Some(sink)),
        }
    }

    pub fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        *self.alert_sink.write() = Some(sink);
        info!("alert sink attached to warning service");
    }

    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            self.cleanup_oldest_internal(&mut warnings);
        }

        debug!(id = %id, category = ?category, severity = ?severity, "added warning");
        warnings.insert(id.clone(), warning.clone());

        if let Some(sink) = self.alert_sink.read().clone() {
            tokio::spawn(async move {
                sink.notify(&warning).await;
            });
        }

        id
    }

    pub fn warn(
        self: &Arc<Self>,
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> String {
        self.add_warning(category, severity, message.into(), source.into())
    }

    pub fn get_all_warnings(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn get_warnings_by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings.read().values().filter(|w| w.severity == severity).cloned().collect()
    }

    pub fn get_warnings_by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings.read().values().filter(|w| w.category == category).cloned().collect()
    }

    pub fn get_unacknowledged_warnings(&self) -> Vec<Warning> {
        self.warnings.read().values().filter(|w| !w.acknowledged).cloned().collect()
    }

    pub fn get_active_warnings(&self, max_age_minutes: i64) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged && w.age_minutes() <= max_age_minutes)
            .cloned()
            .collect()
    }

    pub fn get_critical_warnings(&self) -> Vec<Warning> {
        self.get_warnings_by_severity(WarningSeverity::Critical)
    }

    pub fn acknowledge_warning(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(Utc::now());
            debug!(id = %id, "warning acknowledged");
            true
        } else {
            false
        }
    }

    pub fn acknowledge_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Warning) -> bool,
    {
        let mut warnings = self.warnings.write();
        let now = Utc::now();
        let mut count = 0;
        for warning in warnings.values_mut() {
            if !warning.acknowledged && predicate(warning) {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
                count += 1;
            }
        }
        if count > 0 {
            debug!(count = count, "acknowledged warnings");
        }
        count
    }

    pub fn auto_acknowledge_old_warnings(&self) -> usize {
        let threshold_hours = self.config.auto_acknowledge_hours;
        self.acknowledge_matching(|w| w.age_minutes() > threshold_hours * 60)
    }

    pub fn clear_old_warnings(&self, hours_old: i64) -> usize {
        let mut warnings = self.warnings.write();
        let threshold_minutes = hours_old * 60;
        let before_count = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= threshold_minutes);
        let removed = before_count - warnings.len();
        if removed > 0 {
            info!(removed = removed, "cleared old warnings");
        }
        removed
    }

    pub fn clear_acknowledged(&self) -> usize {
        let mut warnings = self.warnings.write();
        let before_count = warnings.len();
        warnings.retain(|_, w| !w.acknowledged);
        before_count - warnings.len()
    }

    pub fn remove_warning(&self, id: &str) -> bool {
        self.warnings.write().remove(id).is_some()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings.read().values().filter(|w| !w.acknowledged).count()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }

    pub fn has_critical_warnings(&self) -> bool {
        self.warnings
            .read()
            .values()
            .any(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
    }

    /// Called on the Supervisor's metrics tick.
    pub fn cleanup(&self) {
        self.auto_acknowledge_old_warnings();
        self.clear_old_warnings(self.config.max_warning_age_hours);
    }

    fn cleanup_oldest_internal(&self, warnings: &mut HashMap<String, Warning>) {
        let to_remove = warnings.len() / 10;
        if to_remove == 0 {
            return;
        }
        let mut sorted: Vec<_> = warnings.iter().collect();
        sorted.sort_by_key(|(_, w)| w.created_at);
        let ids_to_remove: Vec<String> = sorted.into_iter().take(to_remove).map(|(id, _)| id.clone()).collect();
        for id in ids_to_remove {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get_warning() {
        let service = WarningService::default();
        let id = service.add_warning(WarningCategory::Dispatch, WarningSeverity::Error, "test error".to_string(), "test".to_string());
        let warnings = service.get_all_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, id);
    }

    #[test]
    fn acknowledge_warning() {
        let service = WarningService::default();
        let id = service.add_warning(WarningCategory::Queue, WarningSeverity::Warn, "test warning".to_string(), "test".to_string());
        assert_eq!(service.unacknowledged_count(), 1);
        service.acknowledge_warning(&id);
        assert_eq!(service.unacknowledged_count(), 0);
    }

    #[test]
    fn filter_by_severity() {
        let service = WarningService::default();
        service.add_warning(WarningCategory::Ingestion, WarningSeverity::Warn, "warn".to_string(), "test".to_string());
        service.add_warning(WarningCategory::CircuitBreaker, WarningSeverity::Critical, "critical".to_string(), "test".to_string());

        let critical = service.get_critical_warnings();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].message, "critical");
    }
}
