//! KeywordDetector - Alert Rules over Analysis Text
//!
//! ## Responsibilities
//!
//! - Hold keyword alert rules loaded at startup
//! - Match a frame's description and keywords against every enabled rule
//! - Per-source rule scoping and per-rule cooldown
//!
//! Matching is whole-word and case-insensitive. Delivering the alert
//! anywhere is up to the caller; matches are attached to the event.

use crate::error::{Error, Result};
use crate::frame_grabber::SourceId;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

fn default_cooldown_secs() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// Alert priority
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Keyword alert rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AlertRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub keywords: Vec<String>,
    /// Sources the rule applies to; absent or empty means all
    #[serde(default)]
    pub source_ids: Option<Vec<SourceId>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: AlertPriority,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            source_ids: None,
            enabled: true,
            priority: AlertPriority::Normal,
            cooldown_secs: default_cooldown_secs(),
        }
    }

    fn applies_to(&self, source_id: SourceId) -> bool {
        match &self.source_ids {
            Some(ids) if !ids.is_empty() => ids.contains(&source_id),
            _ => true,
        }
    }
}

/// A rule that fired for one frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertMatch {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub keywords_matched: Vec<String>,
    pub priority: AlertPriority,
}

/// Rule summary for the status API
#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub keywords_count: usize,
    pub source_ids: Option<Vec<SourceId>>,
    pub priority: AlertPriority,
    pub cooldown_secs: u64,
    pub last_alert: Option<DateTime<Utc>>,
}

struct CompiledRule {
    rule: AlertRule,
    /// One pattern per keyword, same order
    patterns: Vec<Regex>,
}

impl CompiledRule {
    fn compile(rule: AlertRule) -> Result<Self> {
        let patterns = rule
            .keywords
            .iter()
            .map(|keyword| {
                RegexBuilder::new(&format!(r"\b{}\b", regex::escape(keyword.trim())))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("Invalid keyword {:?}: {}", keyword, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rule, patterns })
    }

    fn matched_keywords(&self, text: &str) -> Vec<String> {
        self.rule
            .keywords
            .iter()
            .zip(&self.patterns)
            .filter(|(_, pattern)| pattern.is_match(text))
            .map(|(keyword, _)| keyword.clone())
            .collect()
    }
}

#[derive(Clone, Copy)]
struct LastAlert {
    at: Instant,
    wall: DateTime<Utc>,
}

#[derive(Default)]
struct DetectorInner {
    rules: HashMap<Uuid, CompiledRule>,
    last_alert: HashMap<Uuid, LastAlert>,
}

/// Keyword alert detector, shared by all queue workers
#[derive(Default)]
pub struct KeywordDetector {
    inner: RwLock<DetectorInner>,
}

impl KeywordDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector preloaded with `rules`
    pub async fn with_rules(rules: Vec<AlertRule>) -> Result<Self> {
        let detector = Self::new();
        for rule in rules {
            detector.add_rule(rule).await?;
        }
        Ok(detector)
    }

    /// Add or replace a rule. Blank keywords are dropped; a rule left
    /// without keywords is rejected.
    pub async fn add_rule(&self, mut rule: AlertRule) -> Result<()> {
        if rule.name.trim().is_empty() {
            return Err(Error::Validation("Alert rule name must not be empty".to_string()));
        }
        rule.keywords.retain(|k| !k.trim().is_empty());
        if rule.keywords.is_empty() {
            return Err(Error::Validation(format!(
                "Alert rule {} has no keywords",
                rule.name
            )));
        }

        let compiled = CompiledRule::compile(rule)?;
        let (id, name) = (compiled.rule.id, compiled.rule.name.clone());
        self.inner.write().await.rules.insert(id, compiled);
        tracing::info!(rule_id = %id, name = %name, "Alert rule added");
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        inner.last_alert.remove(&rule_id);
        let removed = inner.rules.remove(&rule_id).is_some();
        if removed {
            tracing::info!(rule_id = %rule_id, "Alert rule removed");
        }
        removed
    }

    pub async fn clear_rules(&self) {
        let mut inner = self.inner.write().await;
        inner.rules.clear();
        inner.last_alert.clear();
    }

    /// Rules sorted by name
    pub async fn get_rules(&self) -> Vec<AlertRule> {
        let inner = self.inner.read().await;
        let mut rules: Vec<_> = inner.rules.values().map(|c| c.rule.clone()).collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rules.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rules.is_empty()
    }

    /// Match one analysis against every enabled rule.
    ///
    /// A rule that fires starts its cooldown; while cooling down it is
    /// skipped entirely.
    pub async fn detect(&self, description: &str, keywords: &[String], source_id: SourceId) -> Vec<AlertMatch> {
        let mut text = description.to_string();
        if !keywords.is_empty() {
            text.push(' ');
            text.push_str(&keywords.join(" "));
        }

        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let DetectorInner { rules, last_alert } = &mut *inner;

        let mut matches = Vec::new();
        for (rule_id, compiled) in rules.iter() {
            let rule = &compiled.rule;
            if !rule.enabled || !rule.applies_to(source_id) {
                continue;
            }
            let cooling = last_alert.get(rule_id).is_some_and(|last| {
                now.duration_since(last.at) < Duration::from_secs(rule.cooldown_secs)
            });
            if cooling {
                continue;
            }

            let matched = compiled.matched_keywords(&text);
            if matched.is_empty() {
                continue;
            }

            last_alert.insert(*rule_id, LastAlert { at: now, wall: Utc::now() });
            tracing::info!(
                rule_id = %rule_id,
                rule = %rule.name,
                source_id = %source_id,
                keywords = ?matched,
                "Alert rule matched"
            );
            matches.push(AlertMatch {
                rule_id: *rule_id,
                rule_name: rule.name.clone(),
                keywords_matched: matched,
                priority: rule.priority,
            });
        }

        matches.sort_by(|a, b| a.rule_name.cmp(&b.rule_name));
        matches
    }

    /// Let a rule fire again immediately
    pub async fn reset_cooldown(&self, rule_id: Uuid) {
        self.inner.write().await.last_alert.remove(&rule_id);
    }

    pub async fn rule_stats(&self, rule_id: Uuid) -> Option<RuleStats> {
        let inner = self.inner.read().await;
        let compiled = inner.rules.get(&rule_id)?;
        Some(stats_for(&compiled.rule, inner.last_alert.get(&rule_id)))
    }

    /// Stats for every rule, sorted by name
    pub async fn all_stats(&self) -> Vec<RuleStats> {
        let inner = self.inner.read().await;
        let mut stats: Vec<_> = inner
            .rules
            .iter()
            .map(|(id, compiled)| stats_for(&compiled.rule, inner.last_alert.get(id)))
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

fn stats_for(rule: &AlertRule, last: Option<&LastAlert>) -> RuleStats {
    RuleStats {
        id: rule.id,
        name: rule.name.clone(),
        enabled: rule.enabled,
        keywords_count: rule.keywords.len(),
        source_ids: rule.source_ids.clone(),
        priority: rule.priority,
        cooldown_secs: rule.cooldown_secs,
        last_alert: last.map(|l| l.wall),
    }
}

/// Parse a JSON array of alert rules
pub fn parse_rules(json: &str) -> Result<Vec<AlertRule>> {
    serde_json::from_str(json).map_err(|e| Error::Config(format!("Invalid alert rules file: {}", e)))
}

/// Load alert rules. A missing file means no rules.
pub async fn load_rules(path: &Path) -> Result<Vec<AlertRule>> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => {
            let rules = parse_rules(&json)?;
            tracing::info!(path = %path.display(), count = rules.len(), "Alert rules loaded");
            Ok(rules)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No alert rules file, keyword alerts disabled");
            Ok(Vec::new())
        }
        Err(e) => Err(Error::Config(format!(
            "Failed to read alert rules {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_whole_word_case_insensitive() {
        let mut rule = AlertRule::new("intrusion", &["pessoa", "arma"]);
        rule.cooldown_secs = 0;
        let detector = KeywordDetector::with_rules(vec![rule]).await.unwrap();
        let source = Uuid::new_v4();

        let hits = detector.detect("Uma PESSOA no portão", &[], source).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].keywords_matched, vec!["pessoa"]);

        // "armazém" contains "arma" but not as a word
        assert!(detector.detect("Porta do armazém aberta", &[], source).await.is_empty());
    }

    #[tokio::test]
    async fn test_extracted_keywords_are_searched() {
        let detector = KeywordDetector::with_rules(vec![AlertRule::new("vehicles", &["carro", "moto"])])
            .await
            .unwrap();

        let hits = detector
            .detect("Rua movimentada", &words(&["Carro", "moto"]), Uuid::new_v4())
            .await;
        assert_eq!(hits[0].keywords_matched, vec!["carro", "moto"]);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat() {
        let rule = AlertRule::new("fire", &["fogo"]);
        let rule_id = rule.id;
        let detector = KeywordDetector::with_rules(vec![rule]).await.unwrap();
        let source = Uuid::new_v4();

        assert_eq!(detector.detect("fogo na cozinha", &[], source).await.len(), 1);
        assert!(detector.detect("fogo na cozinha", &[], source).await.is_empty());
        assert!(detector.rule_stats(rule_id).await.unwrap().last_alert.is_some());

        detector.reset_cooldown(rule_id).await;
        assert_eq!(detector.detect("fogo na cozinha", &[], source).await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_cooldown_fires_every_time() {
        let mut rule = AlertRule::new("fire", &["fogo"]);
        rule.cooldown_secs = 0;
        let detector = KeywordDetector::with_rules(vec![rule]).await.unwrap();
        let source = Uuid::new_v4();

        for _ in 0..3 {
            assert_eq!(detector.detect("fogo", &[], source).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_source_filter() {
        let gate = Uuid::new_v4();
        let lobby = Uuid::new_v4();
        let mut scoped = AlertRule::new("gate only", &["pessoa"]);
        scoped.source_ids = Some(vec![gate]);
        let mut everywhere = AlertRule::new("anywhere", &["pessoa"]);
        everywhere.source_ids = Some(vec![]);
        let detector = KeywordDetector::with_rules(vec![scoped, everywhere]).await.unwrap();

        let lobby_hits = detector.detect("pessoa", &[], lobby).await;
        assert_eq!(lobby_hits.len(), 1);
        assert_eq!(lobby_hits[0].rule_name, "anywhere");

        let gate_hits = detector.detect("pessoa", &[], gate).await;
        assert_eq!(gate_hits.len(), 1);
        assert_eq!(gate_hits[0].rule_name, "gate only");
    }

    #[tokio::test]
    async fn test_disabled_rule_never_fires() {
        let mut rule = AlertRule::new("off", &["pessoa"]);
        rule.enabled = false;
        let detector = KeywordDetector::with_rules(vec![rule]).await.unwrap();
        assert!(detector.detect("pessoa", &[], Uuid::new_v4()).await.is_empty());
    }

    #[tokio::test]
    async fn test_rule_validation_and_removal() {
        let detector = KeywordDetector::new();
        assert!(matches!(
            detector.add_rule(AlertRule::new("empty", &[" "])).await,
            Err(Error::Validation(_))
        ));

        let rule = AlertRule::new("fire", &["fogo", ""]);
        let id = rule.id;
        detector.add_rule(rule).await.unwrap();
        assert_eq!(detector.len().await, 1);
        assert_eq!(detector.get_rules().await[0].keywords, vec!["fogo"]);
        assert!(detector.detect("porta aberta", &[], Uuid::new_v4()).await.is_empty());
        assert!(detector.remove_rule(id).await);
        assert!(!detector.remove_rule(id).await);
        assert!(detector.is_empty().await);
    }

    #[test]
    fn test_parse_rules_defaults() {
        let rules = parse_rules(
            r#"[{"name": "intrusion", "keywords": ["pessoa"], "priority": "high"},
                {"name": "fire", "keywords": ["fogo"], "cooldown_secs": 60, "enabled": false}]"#,
        )
        .unwrap();

        assert_eq!(rules[0].priority, AlertPriority::High);
        assert_eq!(rules[0].cooldown_secs, 300);
        assert!(rules[0].enabled);
        assert_ne!(rules[0].id, rules[1].id);
        assert!(!rules[1].enabled);

        assert!(matches!(parse_rules(r#"[{"name": "x"}]"#), Err(Error::Config(_))));
        assert!(matches!(
            parse_rules(r#"[{"name": "x", "keywords": ["a"], "phone": "1"}]"#),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_rules_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_rules(&dir.path().join("none.json")).await.unwrap().is_empty());

        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"[{"name": "fire", "keywords": ["fogo"]}]"#).unwrap();
        assert_eq!(load_rules(&path).await.unwrap().len(), 1);
    }
}
