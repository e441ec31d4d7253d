//! Rule file storage
//!
//! Reads and writes the rule set as one JSON array.

use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::core::{AccessRuleError, RuleResult};
use crate::rules::AccessRule;

/// Default location of the rule file
pub const DEFAULT_RULES_PATH: &str = "/var/lib/snapd/state/access-rules.json";

/// JSON file holding every access rule
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    /// Create a store for the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the rule file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the rule file exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load every well-formed rule from the file.
    ///
    /// A missing file is an empty rule set. Elements which do not decode as
    /// rules are skipped; a file which is not a JSON array is an error.
    pub fn load(&self) -> RuleResult<Vec<AccessRule>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No rule file at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let elements: Vec<Value> = serde_json::from_str(&contents)?;
        let mut rules = Vec::with_capacity(elements.len());
        for (position, element) in elements.into_iter().enumerate() {
            match serde_json::from_value::<AccessRule>(element) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed rule #{} in {}: {}",
                        position,
                        self.path.display(),
                        e
                    );
                }
            }
        }
        Ok(rules)
    }

    /// Atomically replace the file with `rules`, sorted by ID
    pub fn save<'a, I>(&self, rules: I) -> RuleResult<()>
    where
        I: IntoIterator<Item = &'a AccessRule>,
    {
        let mut rules: Vec<&AccessRule> = rules.into_iter().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        let bytes = serde_json::to_vec(&rules)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        ensure_dir(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| AccessRuleError::Io(e.error))?;

        #[cfg(unix)]
        {
            if let Ok(dir) = fs::File::open(dir) {
                let _ = dir.sync_all();
            }
        }

        tracing::debug!("Wrote {} rules to {}", rules.len(), self.path.display());
        Ok(())
    }
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)
}
