//! Declarative per-column transforms. A closed enumeration on purpose:
//! adding a kind is a code change, which keeps the redaction layer's
//! surface auditable. Rules match `(table, column)` and run in
//! configuration order over a snapshot of the row, so each rule is a
//! pure function of its input.

mod hashers;
mod names;

pub use hashers::{Argon2idParams, BcryptParams, Pbkdf2Params, ScryptParams, DEFAULT_CLEARTEXT};

use std::fs;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use common::change::ColumnValue;
use common::err::{KResult, KashoError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub table: String,
    pub column: String,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// Transform kinds; names here are the configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RuleKind {
    FakeName,
    Template {
        format: String,
    },
    PasswordArgon2id(Argon2idParams),
    PasswordBcrypt(BcryptParams),
    PasswordScrypt(ScryptParams),
    #[serde(rename = "PasswordPBKDF2")]
    PasswordPbkdf2(Pbkdf2Params),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RulesetFile {
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default)]
pub struct TransformEngine {
    rules: Vec<Rule>,
}

impl TransformEngine {
    /// Pass-through engine; rows flow untouched.
    pub fn empty() -> Self {
        TransformEngine { rules: Vec::new() }
    }

    pub fn load(path: &str) -> KResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| KashoError::Config(format!("transform ruleset {}: {}", path, e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(yaml: &str) -> KResult<Self> {
        let file: RulesetFile = serde_yaml::from_str(yaml)
            .map_err(|e| KashoError::Config(format!("transform ruleset: {}", e)))?;
        Ok(TransformEngine { rules: file.rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite one row in place. Null cells pass through untouched — a
    /// redaction rule has nothing to redact in an absent value.
    pub fn apply(
        &self,
        table: &str,
        columnnames: &[String],
        columnvalues: &mut [ColumnValue],
    ) -> KResult<()> {
        if self.rules.is_empty() {
            return Ok(());
        }
        // rules read the pre-transform row
        let snapshot: Vec<ColumnValue> = columnvalues.to_vec();
        for rule in self.rules.iter().filter(|r| r.table == table) {
            let idx = match columnnames.iter().position(|c| *c == rule.column) {
                Some(idx) => idx,
                None => continue,
            };
            if snapshot[idx].is_null() {
                continue;
            }
            let original = snapshot[idx].as_text();
            let replaced = match &rule.kind {
                RuleKind::FakeName => fake_name(&original),
                RuleKind::Template { format } => {
                    template::expand(format, columnnames, &snapshot, &rule.column)?
                }
                RuleKind::PasswordArgon2id(p) => hashers::argon2id(&original, &rule.column, p)?,
                RuleKind::PasswordBcrypt(p) => hashers::bcrypt_hash(&original, &rule.column, p)?,
                RuleKind::PasswordScrypt(p) => hashers::scrypt_hash(&original, &rule.column, p)?,
                RuleKind::PasswordPbkdf2(p) => hashers::pbkdf2_hash(&original, &rule.column, p)?,
            };
            columnvalues[idx] = ColumnValue::String(replaced);
        }
        Ok(())
    }
}

/// Deterministic fake name: the original value seeds the pick, so the
/// same input redacts to the same name on every run.
fn fake_name(original: &str) -> String {
    let digest = Sha256::digest(original.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
    let first = names::FIRST_NAMES[rng.gen_range(0..names::FIRST_NAMES.len())];
    let last = names::LAST_NAMES[rng.gen_range(0..names::LAST_NAMES.len())];
    format!("{} {}", first, last)
}

mod template {
    use common::change::ColumnValue;
    use common::err::{KResult, KashoError};

    /// Expand `{{col}}` placeholders from peer columns of the same row.
    /// Unknown column references fail the row.
    pub fn expand(
        format: &str,
        columnnames: &[String],
        row: &[ColumnValue],
        target_column: &str,
    ) -> KResult<String> {
        let mut out = String::with_capacity(format.len());
        let mut rest = format;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| KashoError::Transform {
                rule: "Template".to_string(),
                column: target_column.to_string(),
                cause: "unterminated {{placeholder}}".to_string(),
            })?;
            let name = after[..close].trim();
            let idx = columnnames
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| KashoError::Transform {
                    rule: "Template".to_string(),
                    column: target_column.to_string(),
                    cause: format!("unknown column {:?} in template", name),
                })?;
            out.push_str(&row[idx].as_text());
            rest = &after[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row() -> (Vec<String>, Vec<ColumnValue>) {
        (
            vec!["id".into(), "name".into(), "email".into(), "password".into()],
            vec![
                ColumnValue::Int(7),
                ColumnValue::String("Alice Real".into()),
                ColumnValue::String("alice@real.example".into()),
                ColumnValue::String("s3cret".into()),
            ],
        )
    }

    #[test]
    fn fake_name_is_deterministic_and_different() {
        assert_eq!(fake_name("Alice Real"), fake_name("Alice Real"));
        assert_ne!(fake_name("Alice Real"), "Alice Real");
    }

    #[test]
    fn template_substitutes_peer_columns() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: users\n\
               column: email\n\
               kind: Template\n\
               format: \"user-{{id}}@masked.example\"\n",
        )
        .unwrap();
        let (names, mut values) = row();
        engine.apply("users", &names, &mut values).unwrap();
        assert_eq!(values[2], ColumnValue::String("user-7@masked.example".into()));
        // untouched columns survive
        assert_eq!(values[1], ColumnValue::String("Alice Real".into()));
    }

    #[test]
    fn rules_only_match_their_table() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: other\n\
               column: name\n\
               kind: FakeName\n",
        )
        .unwrap();
        let (names, mut values) = row();
        engine.apply("users", &names, &mut values).unwrap();
        assert_eq!(values[1], ColumnValue::String("Alice Real".into()));
    }

    #[test]
    fn password_rule_from_yaml_is_stable() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: users\n\
               column: password\n\
               kind: PasswordArgon2id\n\
               memory_kib: 64\n\
               time_cost: 1\n",
        )
        .unwrap();
        let (names, mut a) = row();
        let (_, mut b) = row();
        engine.apply("users", &names, &mut a).unwrap();
        engine.apply("users", &names, &mut b).unwrap();
        assert_eq!(a[3], b[3]);
        match &a[3] {
            ColumnValue::String(s) => assert!(s.contains('$')),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn null_cells_pass_through() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: users\n\
               column: name\n\
               kind: FakeName\n",
        )
        .unwrap();
        let names = vec!["name".to_string()];
        let mut values = vec![ColumnValue::Null];
        engine.apply("users", &names, &mut values).unwrap();
        assert!(values[0].is_null());
    }

    #[test]
    fn unknown_template_column_names_rule_and_column() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: users\n\
               column: email\n\
               kind: Template\n\
               format: \"{{nope}}\"\n",
        )
        .unwrap();
        let (names, mut values) = row();
        match engine.apply("users", &names, &mut values) {
            Err(KashoError::Transform { rule, column, .. }) => {
                assert_eq!(rule, "Template");
                assert_eq!(column, "email");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rules_apply_in_configuration_order() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: users\n\
               column: name\n\
               kind: FakeName\n\
             - table: users\n\
               column: email\n\
               kind: Template\n\
               format: \"{{name}}@masked.example\"\n",
        )
        .unwrap();
        let (names, mut values) = row();
        engine.apply("users", &names, &mut values).unwrap();
        // the template reads the snapshot, not the already-faked name
        assert_eq!(
            values[2],
            ColumnValue::String("Alice Real@masked.example".into())
        );
    }

    #[test]
    fn pbkdf2_kind_spells_out_the_acronym() {
        let engine = TransformEngine::from_yaml(
            "rules:\n\
             - table: users\n\
               column: password\n\
               kind: PasswordPBKDF2\n\
               rounds: 1000\n",
        )
        .unwrap();
        let (names, mut values) = row();
        engine.apply("users", &names, &mut values).unwrap();
        assert_ne!(values[3], ColumnValue::String("s3cret".into()));
    }
}
