#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use data_agent_domain::{PiiMatch, PiiType, PolicyResult, Severity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

const DDL_KEYWORDS: [&str; 5] = ["CREATE", "DROP", "ALTER", "TRUNCATE", "RENAME"];
const DML_KEYWORDS: [&str; 4] = ["INSERT", "UPDATE", "DELETE", "MERGE"];
const DANGEROUS_KEYWORDS: [&str; 9] = [
    "GRANT", "REVOKE", "EXEC", "EXECUTE", "CALL", "LOAD", "COPY", "IMPORT", "EXPORT",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub allowed_columns: Vec<String>,
    pub blocked_columns: Vec<String>,
    pub enforce_query_policy: bool,
    pub scan_results_for_pii: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_columns: Vec::new(),
            blocked_columns: vec![
                "*.password".to_string(),
                "*.ssn".to_string(),
                "*.credit_card".to_string(),
            ],
            enforce_query_policy: true,
            scan_results_for_pii: true,
        }
    }
}

/// Read-only SQL gate: blocks schema changes, writes, administrative
/// statements and common injection shapes.
#[derive(Debug, Clone)]
pub struct SqlPolicyChecker {
    word: Regex,
}

impl SqlPolicyChecker {
    /// # Errors
    /// Returns an error if the tokenizer pattern fails to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            word: compile(r"[A-Za-z_][A-Za-z0-9_]*")?,
        })
    }

    #[must_use]
    pub fn check_query(&self, query: &str) -> PolicyResult {
        let words: BTreeSet<String> = self
            .word
            .find_iter(query)
            .map(|found| found.as_str().to_ascii_uppercase())
            .collect();

        let mut result = PolicyResult::allow();
        let groups: [(&[&str], &str); 3] = [
            (&DDL_KEYWORDS, "DDL operation blocked"),
            (&DML_KEYWORDS, "DML operation blocked"),
            (&DANGEROUS_KEYWORDS, "Dangerous operation blocked"),
        ];
        for (keywords, label) in groups {
            for keyword in keywords {
                if words.contains(*keyword) {
                    result.add_violation(format!("{label}: {keyword}"), Severity::Critical);
                }
            }
        }

        let trimmed = query.trim();
        let inline_comment = ["--", "/*"]
            .iter()
            .any(|marker| trimmed.find(marker).is_some_and(|pos| pos > 0));
        if inline_comment {
            result.add_violation(
                "SQL comment detected (potential injection)".to_string(),
                Severity::High,
            );
        }

        if trimmed.trim_end_matches(';').contains(';') {
            result.add_violation(
                "Multiple statements detected (potential injection)".to_string(),
                Severity::High,
            );
        }

        result
            .metadata
            .insert("query_length".to_string(), json!(query.chars().count()));
        if !result.allowed {
            warn!(severity = %result.severity, violations = result.violations.len(), "query blocked by policy");
        }
        result
    }
}

/// Pattern-based PII detection. Card-like digit runs must pass a Luhn check.
#[derive(Debug, Clone)]
pub struct PiiDetector {
    ssn: Regex,
    credit_card: Regex,
    email: Regex,
    phone: Regex,
}

impl PiiDetector {
    /// # Errors
    /// Returns an error if a detection pattern fails to compile.
    pub fn new() -> Result<Self> {
        Ok(Self {
            ssn: compile(r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b")?,
            credit_card: compile(r"\b(?:[0-9]{4}[-\s]?){3}[0-9]{4}\b")?,
            email: compile(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")?,
            phone: compile(
                r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b",
            )?,
        })
    }

    #[must_use]
    pub fn detect_pii(&self, text: &str, location: &str) -> Vec<PiiMatch> {
        let mut matches = Vec::new();
        let mut push = |pii_type: PiiType, value: &str, confidence: f64| {
            matches.push(PiiMatch {
                pii_type,
                value: value.to_string(),
                location: location.to_string(),
                confidence,
            });
        };

        for found in self.ssn.find_iter(text) {
            push(PiiType::Ssn, found.as_str(), 0.95);
        }
        for found in self.credit_card.find_iter(text) {
            if luhn_valid(found.as_str()) {
                push(PiiType::CreditCard, found.as_str(), 0.90);
            }
        }
        for found in self.email.find_iter(text) {
            push(PiiType::Email, found.as_str(), 0.85);
        }
        for found in self.phone.find_iter(text) {
            push(PiiType::Phone, found.as_str(), 0.80);
        }
        matches
    }
}

/// Luhn checksum over the digits of `candidate`, requiring 13 to 19 digits.
#[must_use]
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|ch| ch.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let checksum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, digit)| {
            if idx % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                *digit
            }
        })
        .sum();
    checksum % 10 == 0
}

/// Wildcard allow/deny lists over `table.column` names. Deny always wins.
#[derive(Debug, Clone)]
pub struct ColumnAccessControl {
    allowed: Vec<(String, Regex)>,
    blocked: Vec<(String, Regex)>,
}

impl ColumnAccessControl {
    /// # Errors
    /// Returns an error if a wildcard pattern cannot be turned into a regex.
    pub fn new(allowed_patterns: &[String], blocked_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            allowed: compile_wildcards(allowed_patterns)?,
            blocked: compile_wildcards(blocked_patterns)?,
        })
    }

    #[must_use]
    pub fn check_column_access(&self, table: &str, column: &str) -> PolicyResult {
        let full_name = format!("{table}.{column}");
        let mut result = PolicyResult::allow();

        if let Some((pattern, _)) = self
            .blocked
            .iter()
            .find(|(_, regex)| regex.is_match(&full_name))
        {
            result.add_violation(
                format!("Column access denied: {full_name} (blocked by pattern: {pattern})"),
                Severity::High,
            );
        } else if !self.allowed.is_empty()
            && !self.allowed.iter().any(|(_, regex)| regex.is_match(&full_name))
        {
            result.add_violation(
                format!("Column access denied: {full_name} (not in whitelist)"),
                Severity::Medium,
            );
        }

        result.metadata.insert("table".to_string(), json!(table));
        result.metadata.insert("column".to_string(), json!(column));
        result
    }
}

fn compile_wildcards(patterns: &[String]) -> Result<Vec<(String, Regex)>> {
    patterns
        .iter()
        .map(|pattern| {
            let body = regex::escape(pattern).replace(r"\*", ".*");
            Ok((pattern.clone(), compile(&format!("^{body}$"))?))
        })
        .collect()
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| anyhow!("invalid policy pattern '{pattern}': {err}"))
}

/// Combined policy surface used by the actor and operators.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    sql: SqlPolicyChecker,
    pii: PiiDetector,
    columns: ColumnAccessControl,
}

impl PolicyGate {
    /// # Errors
    /// Returns an error if any configured pattern fails to compile.
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            sql: SqlPolicyChecker::new()?,
            pii: PiiDetector::new()?,
            columns: ColumnAccessControl::new(&config.allowed_columns, &config.blocked_columns)?,
        })
    }

    #[must_use]
    pub fn check_query(&self, query: &str) -> PolicyResult {
        self.sql.check_query(query)
    }

    #[must_use]
    pub fn detect_pii(&self, text: &str, location: &str) -> Vec<PiiMatch> {
        self.pii.detect_pii(text, location)
    }

    #[must_use]
    pub fn check_column_access(&self, table: &str, column: &str) -> PolicyResult {
        self.columns.check_column_access(table, column)
    }

    /// Check several columns at once; the result carries every violation and
    /// the highest severity.
    #[must_use]
    pub fn validate_column_access(&self, table: &str, columns: &[String]) -> PolicyResult {
        let mut combined = PolicyResult::allow();
        for column in columns {
            let single = self.columns.check_column_access(table, column);
            for violation in single.violations {
                combined.add_violation(violation, single.severity);
            }
        }
        combined.metadata.insert("table".to_string(), json!(table));
        combined
            .metadata
            .insert("columns_checked".to_string(), json!(columns.len()));
        combined
    }

    /// Scan every cell of `rows`, locating matches as `table.column[row=N]`.
    #[must_use]
    pub fn scan_rows_for_pii(&self, rows: &[Map<String, Value>], table: &str) -> Vec<PiiMatch> {
        let mut found = Vec::new();
        for (row_idx, row) in rows.iter().enumerate() {
            for (column, value) in row {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let location = format!("{table}.{column}[row={row_idx}]");
                found.extend(self.pii.detect_pii(&text, &location));
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::{luhn_valid, ColumnAccessControl, PolicyConfig, PolicyGate};
    use data_agent_domain::{PiiType, Severity};
    use serde_json::{json, Map, Value};

    fn gate() -> PolicyGate {
        let gate = PolicyGate::new(&PolicyConfig::default());
        assert!(gate.is_ok());
        gate.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn drop_table_is_critical() {
        let result = gate().check_query("DROP TABLE users");
        assert!(!result.allowed);
        assert_eq!(result.severity, Severity::Critical);
        assert!(result.violations.iter().any(|v| v == "DDL operation blocked: DROP"));
    }

    #[test]
    fn stacked_statements_are_flagged() {
        let result = gate().check_query("SELECT * FROM users; DROP TABLE users;");
        assert!(!result.allowed);
        assert!(result.severity >= Severity::High);
        assert!(result
            .violations
            .iter()
            .any(|v| v.starts_with("Multiple statements detected")));
    }

    #[test]
    fn plain_select_is_allowed() {
        let result = gate().check_query("SELECT id FROM users WHERE age > 18");
        assert!(result.allowed);
        assert_eq!(result.severity, Severity::None);
        assert!(result.violations.is_empty());
        assert_eq!(result.metadata.get("query_length"), Some(&json!(35)));
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let gate = gate();
        assert!(gate.check_query("SELECT created_at, last_update FROM t ORDER BY created_at").allowed);
        assert!(!gate.check_query("select 1; delete from t").allowed);
        assert!(gate.check_query("SELECT 1;").allowed);
    }

    #[test]
    fn inline_comment_is_high_but_leading_comment_is_not() {
        let gate = gate();
        let inline = gate.check_query("SELECT * FROM users WHERE id = 1 -- AND admin");
        assert!(!inline.allowed);
        assert_eq!(inline.severity, Severity::High);
        assert!(gate.check_query("-- monthly report\nSELECT 1").allowed);
    }

    #[test]
    fn detects_each_pii_kind() {
        let gate = gate();
        let ssn = gate.detect_pii("My SSN is 123-45-6789", "test");
        assert_eq!(ssn.len(), 1);
        assert_eq!(ssn[0].pii_type, PiiType::Ssn);
        assert!(ssn[0].confidence > 0.9);

        let email = gate.detect_pii("Contact me at alice@example.com", "test");
        assert_eq!(email.len(), 1);
        assert_eq!(email[0].value, "alice@example.com");

        let phone = gate.detect_pii("Call me at (555) 123-4567", "test");
        assert_eq!(phone.len(), 1);
        assert_eq!(phone[0].pii_type, PiiType::Phone);
        assert!(phone[0].value.contains("555"));

        let card = gate.detect_pii("Card: 4532015112830366", "test");
        assert_eq!(card.len(), 1);
        assert_eq!(card[0].pii_type, PiiType::CreditCard);

        assert!(gate.detect_pii("Card: 1234-5678-9012-3456", "test").is_empty());
        assert!(gate
            .detect_pii("The quick brown fox jumps over the lazy dog", "test")
            .is_empty());
    }

    #[test]
    fn luhn_rejects_short_and_bad_checksums() {
        assert!(luhn_valid("4532 0151 1283 0366"));
        assert!(!luhn_valid("4532015112830367"));
        assert!(!luhn_valid("79927398713"));
    }

    #[test]
    fn blacklist_beats_whitelist() {
        let control = ColumnAccessControl::new(
            &["users.*".to_string()],
            &["*.password".to_string()],
        )
        .unwrap_or_else(|_| unreachable!());
        let denied = control.check_column_access("users", "password");
        assert!(!denied.allowed);
        assert_eq!(denied.severity, Severity::High);

        assert!(control.check_column_access("users", "email").allowed);

        let outside = control.check_column_access("orders", "total");
        assert!(!outside.allowed);
        assert_eq!(outside.severity, Severity::Medium);
    }

    #[test]
    fn empty_lists_allow_everything() {
        let control = ColumnAccessControl::new(&[], &[]).unwrap_or_else(|_| unreachable!());
        assert!(control.check_column_access("any", "thing").allowed);
    }

    #[test]
    fn wildcard_dots_are_literal() {
        let control = ColumnAccessControl::new(&[], &["users.ssn".to_string()])
            .unwrap_or_else(|_| unreachable!());
        assert!(control.check_column_access("usersXssn", "x").allowed);
        assert!(!control.check_column_access("users", "ssn").allowed);
    }

    #[test]
    fn multi_column_check_keeps_max_severity() {
        let result = gate().validate_column_access(
            "customers",
            &["name".to_string(), "ssn".to_string(), "credit_card".to_string()],
        );
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 2);
        assert_eq!(result.severity, Severity::High);
    }

    #[test]
    fn row_scan_reports_locations() {
        let mut row = Map::new();
        row.insert("contact".to_string(), Value::String("bob@example.org".to_string()));
        row.insert("amount".to_string(), json!(12));
        let matches = gate().scan_rows_for_pii(&[Map::new(), row], "customers");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].location, "customers.contact[row=1]");
    }
}
