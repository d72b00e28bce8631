//! Trap and variable rule tables
//!
//! Two lookup tables drive admission and normalisation:
//!
//! * trap rules, keyed by the trap's leading OID: `oid;name[;marker;seconds]`
//! * variable rules, keyed by OID prefix: `oid;name`
//!
//! Both files allow `#` comment lines. OIDs written without the leading `.`
//! are corrected on load. The tables are swapped wholesale on reload, so a
//! reader always sees one complete generation.

use crate::error::RuleError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Variable name that is lifted into [`crate::trap::CanonicalEvent::if_index`]
pub const IF_INDEX: &str = "ifIndex";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldPolicy {
    /// Replaces the variant digit when the hold expires
    pub marker: String,
    pub hold_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapRule {
    pub name: String,
    /// `None` marks a final trap that is never held
    pub hold: Option<HoldPolicy>,
}

impl TrapRule {
    pub fn requires_hold(&self) -> bool {
        self.hold.is_some()
    }
}

pub type TrapRuleTable = HashMap<String, TrapRule>;
pub type VariableRuleTable = HashMap<String, String>;

/// Prefix `.` to OIDs written without it.
pub fn normalize_oid(oid: &str) -> String {
    let oid = oid.trim();
    if oid.starts_with('.') {
        oid.to_string()
    } else {
        format!(".{}", oid)
    }
}

fn data_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

pub fn parse_trap_rules(content: &str) -> Result<TrapRuleTable, RuleError> {
    let mut table = TrapRuleTable::new();

    for (line_no, line) in data_lines(content) {
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(RuleError::MissingFields { line: line_no, expected: 2 });
        }
        if fields[0].is_empty() {
            return Err(RuleError::EmptyOid { line: line_no });
        }

        let hold = if fields.len() >= 4 {
            match fields[3].parse::<u64>() {
                Ok(secs) if secs > 0 => Some(HoldPolicy {
                    marker: fields[2].to_string(),
                    hold_secs: secs,
                }),
                Ok(_) => None,
                Err(e) => {
                    warn!(line = line_no, value = fields[3], "Invalid hold seconds, rule treated as final: {}", e);
                    None
                }
            }
        } else {
            None
        };

        table.insert(
            normalize_oid(fields[0]),
            TrapRule {
                name: fields[1].to_string(),
                hold,
            },
        );
    }

    Ok(table)
}

pub fn parse_variable_rules(content: &str) -> Result<VariableRuleTable, RuleError> {
    let mut table = VariableRuleTable::new();

    for (line_no, line) in data_lines(content) {
        let mut fields = line.splitn(3, ';').map(str::trim);
        let oid = fields.next().unwrap_or_default();
        let name = fields
            .next()
            .ok_or(RuleError::MissingFields { line: line_no, expected: 2 })?;
        if oid.is_empty() {
            return Err(RuleError::EmptyOid { line: line_no });
        }
        table.insert(normalize_oid(oid), name.to_string());
    }

    Ok(table)
}

/// `true` when `prefix` equals `oid` or ends on one of its component boundaries.
fn is_component_prefix(prefix: &str, oid: &str) -> bool {
    match oid.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') || prefix.ends_with('.'),
        None => false,
    }
}

/// Shared, hot-swappable rule tables
#[derive(Debug, Default)]
pub struct RuleTables {
    traps: RwLock<TrapRuleTable>,
    variables: RwLock<VariableRuleTable>,
}

impl RuleTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(traps: TrapRuleTable, variables: VariableRuleTable) -> Self {
        Self {
            traps: RwLock::new(traps),
            variables: RwLock::new(variables),
        }
    }

    pub fn replace_traps(&self, table: TrapRuleTable) {
        debug!("Installing {} trap rules", table.len());
        *self.traps.write() = table;
    }

    pub fn replace_variables(&self, table: VariableRuleTable) {
        debug!("Installing {} variable rules", table.len());
        *self.variables.write() = table;
    }

    pub fn trap_rule(&self, oid: &str) -> Option<TrapRule> {
        self.traps.read().get(oid).cloned()
    }

    pub fn knows_trap(&self, oid: &str) -> bool {
        self.traps.read().contains_key(oid)
    }

    /// Symbolic name of a variable OID, by longest matching prefix.
    pub fn variable_name(&self, oid: &str) -> Option<String> {
        let variables = self.variables.read();
        if let Some(name) = variables.get(oid) {
            return Some(name.clone());
        }
        variables
            .iter()
            .filter(|(prefix, _)| is_component_prefix(prefix, oid))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, name)| name.clone())
    }

    pub fn trap_rule_count(&self) -> usize {
        self.traps.read().len()
    }

    pub fn variable_rule_count(&self) -> usize {
        self.variables.read().len()
    }

    pub async fn load_trap_file(&self, path: &Path) -> Result<usize, RuleError> {
        let content = read_rule_file(path).await?;
        let table = parse_trap_rules(&content)?;
        let count = table.len();
        self.replace_traps(table);
        Ok(count)
    }

    pub async fn load_variable_file(&self, path: &Path) -> Result<usize, RuleError> {
        let content = read_rule_file(path).await?;
        let table = parse_variable_rules(&content)?;
        let count = table.len();
        self.replace_variables(table);
        Ok(count)
    }
}

async fn read_rule_file(path: &Path) -> Result<String, RuleError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RuleError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_and_holdable_trap_rules() {
        let table = parse_trap_rules(
            "# comment\n\
             1.3.6.1.6.3.1.1.5.3;linkDown;9;5\n\
             .1.3.6.1.6.3.1.1.5.4;linkUp\n",
        )
        .unwrap();

        let down = &table[".1.3.6.1.6.3.1.1.5.3"];
        assert_eq!(down.name, "linkDown");
        assert_eq!(
            down.hold,
            Some(HoldPolicy {
                marker: "9".into(),
                hold_secs: 5
            })
        );
        assert!(!table[".1.3.6.1.6.3.1.1.5.4"].requires_hold());
    }

    #[test]
    fn bad_hold_seconds_makes_rule_final() {
        let table = parse_trap_rules(".1.2.3;thing;0;soon\n").unwrap();
        assert!(!table[".1.2.3"].requires_hold());
    }

    #[test]
    fn rejects_line_without_name() {
        let err = parse_trap_rules(".1.2.3\n").unwrap_err();
        assert!(matches!(err, RuleError::MissingFields { line: 1, .. }));
    }

    #[test]
    fn variable_lookup_prefers_longest_component_prefix() {
        let vars = parse_variable_rules(
            ".1.3.6.1.2.1.2.2.1;ifEntry\n\
             .1.3.6.1.2.1.2.2.1.1;ifIndex\n\
             1.3.6.1.2.1.2.2.1.2;ifDescr\n",
        )
        .unwrap();
        let tables = RuleTables::with_tables(TrapRuleTable::new(), vars);

        assert_eq!(tables.variable_name(".1.3.6.1.2.1.2.2.1.1.7").as_deref(), Some(IF_INDEX));
        assert_eq!(tables.variable_name(".1.3.6.1.2.1.2.2.1.2.7").as_deref(), Some("ifDescr"));
        assert_eq!(tables.variable_name(".1.3.6.1.2.1.2.2.1.8.7").as_deref(), Some("ifEntry"));
        // .1.3.6.1.2.1.2.2.1.1 must not claim .1.3.6.1.2.1.2.2.1.10
        assert_eq!(tables.variable_name(".1.3.6.1.2.1.2.2.1.10.7").as_deref(), Some("ifEntry"));
        assert_eq!(tables.variable_name(".1.3.6.1.4.1"), None);
    }

    #[tokio::test]
    async fn load_keeps_previous_table_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traps.txt");
        tokio::fs::write(&path, ".1.2.3;first\n").await.unwrap();

        let tables = RuleTables::new();
        assert_eq!(tables.load_trap_file(&path).await.unwrap(), 1);

        tokio::fs::write(&path, "garbage\n").await.unwrap();
        assert!(tables.load_trap_file(&path).await.is_err());
        assert!(tables.knows_trap(".1.2.3"));
    }
}
