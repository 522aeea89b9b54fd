//! Skill templates.
//!
//! A skill is a single JavaScript module installed at
//! `<skills_dir>/<name>/index.js`. Sources are checked before install: they
//! must export `name`, `description` and `execute`, and must not reach for
//! dynamic evaluation or kill the host process.

use anyhow::Context as _;
use familiar_common::{Error, Result, RunnerConfig};
use regex::Regex;
use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::validate::is_valid_name;

pub const SKILL_FILE: &str = "index.js";

const UNSAFE_PATTERNS: &[&str] = &["eval(", "Function(", "process.exit"];
const REQUIRED_EXPORTS: &[&str] = &["name", "description", "execute"];

struct ExportPatterns {
    es: Regex,
    commonjs: Regex,
    module_object: Regex,
}

fn export_patterns() -> Option<&'static ExportPatterns> {
    static PATTERNS: OnceLock<Option<ExportPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(ExportPatterns {
                es: Regex::new(r"export\s+(?:const|let|var|(?:async\s+)?function\*?)\s+([A-Za-z_$][\w$]*)").ok()?,
                commonjs: Regex::new(r"\bexports\.([A-Za-z_$][\w$]*)\s*=").ok()?,
                module_object: Regex::new(r"module\.exports\s*=\s*\{([^}]*)\}").ok()?,
            })
        })
        .as_ref()
}

/// Names a source exports, in any of the supported styles.
fn exported_names(source: &str) -> Vec<String> {
    let Some(p) = export_patterns() else {
        return Vec::new();
    };
    let mut names: Vec<String> = p
        .es
        .captures_iter(source)
        .chain(p.commonjs.captures_iter(source))
        .map(|c| c[1].to_string())
        .collect();

    for object in p.module_object.captures_iter(source) {
        for entry in object[1].split(',') {
            // `name`, `name: value`, `execute() {`, `async execute`
            let key = entry
                .trim()
                .trim_start_matches("async ")
                .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                .next()
                .unwrap_or_default();
            if !key.is_empty() {
                names.push(key.to_string());
            }
        }
    }
    names
}

/// Check a skill source. All problems are reported together.
pub fn validate_skill_source(source: &str) -> Result<()> {
    let mut errors: Vec<String> = UNSAFE_PATTERNS
        .iter()
        .filter(|p| source.contains(*p))
        .map(|p| format!("unsafe pattern '{p}' is not allowed"))
        .collect();

    let exported = exported_names(source);
    for required in REQUIRED_EXPORTS {
        if !exported.iter().any(|n| n == required) {
            errors.push(format!("missing export '{required}'"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillInfo {
    pub name: String,
    pub path: PathBuf,
}

pub struct SkillInstaller {
    skills_dir: PathBuf,
}

impl SkillInstaller {
    pub fn new(skills_dir: impl Into<PathBuf>) -> Self {
        Self {
            skills_dir: skills_dir.into(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.skills_dir.clone())
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    /// Validate and install a skill, replacing any previous version.
    pub fn install(&self, name: &str, source: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(Error::InvalidInput(format!(
                "Invalid skill name '{name}': use lowercase letters, digits, '-' and '_'"
            )));
        }
        validate_skill_source(source)?;

        let dir = self.skills_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(SKILL_FILE);

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(source.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::info!(skill = %name, path = %path.display(), "Skill installed");
        Ok(path)
    }

    /// Installed skills, sorted by name.
    pub fn list(&self) -> anyhow::Result<Vec<SkillInfo>> {
        if !self.skills_dir.exists() {
            return Ok(Vec::new());
        }

        let mut skills = Vec::new();
        for entry in std::fs::read_dir(&self.skills_dir)
            .with_context(|| format!("Failed to read {}", self.skills_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path().join(SKILL_FILE);
            if path.is_file() {
                skills.push(SkillInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path,
                });
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(skills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ES_SKILL: &str = r#"
export const name = "summarize";
export const description = "Summarize a document";
export async function execute(input) {
  return input.text.slice(0, 100);
}
"#;

    const CJS_SKILL: &str = r#"
module.exports = {
  name: "fetch-feed",
  description: "Fetch an RSS feed",
  async execute(ctx) { return ctx.url; },
};
"#;

    fn errors(source: &str) -> Vec<String> {
        match validate_skill_source(source) {
            Err(Error::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_es_and_commonjs() {
        assert!(validate_skill_source(ES_SKILL).is_ok());
        assert!(validate_skill_source(CJS_SKILL).is_ok());

        let assigned = "exports.name = 'a';\nexports.description = 'b';\nexports.execute = async () => 1;";
        assert!(validate_skill_source(assigned).is_ok());
    }

    #[test]
    fn test_rejects_unsafe_patterns() {
        for bad in ["eval(input)", "new Function(code)()", "process.exit(1)"] {
            let source = format!("{ES_SKILL}\n{bad};");
            let errs = errors(&source);
            assert_eq!(errs.len(), 1, "{errs:?}");
            assert!(errs[0].starts_with("unsafe pattern"));
        }
    }

    #[test]
    fn test_reports_missing_exports() {
        let errs = errors("export const name = 'x';");
        assert_eq!(errs, vec!["missing export 'description'", "missing export 'execute'"]);
    }

    #[test]
    fn test_install_and_list() {
        let tmp = TempDir::new().unwrap();
        let installer = SkillInstaller::new(tmp.path().join("skills"));
        assert!(installer.list().unwrap().is_empty());

        let path = installer.install("summarize", ES_SKILL).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), ES_SKILL);
        installer.install("fetch-feed", CJS_SKILL).unwrap();
        // Reinstall replaces
        installer.install("summarize", CJS_SKILL).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CJS_SKILL);

        let names: Vec<String> = installer.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["fetch-feed", "summarize"]);
    }

    #[test]
    fn test_install_rejects_bad_name_and_source() {
        let tmp = TempDir::new().unwrap();
        let installer = SkillInstaller::new(tmp.path());

        assert!(matches!(installer.install("Bad Name", ES_SKILL), Err(Error::InvalidInput(_))));
        assert!(matches!(
            installer.install("evil", &format!("{ES_SKILL}eval(x)")),
            Err(Error::Validation(_))
        ));
        assert!(!tmp.path().join("evil").exists());
    }
}
