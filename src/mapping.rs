//! Implementation file -> test file mapping
//!
//! Rules are tried in order. A rule only wins if it produces at least one
//! file the index actually knows about; otherwise the next matching rule
//! gets a chance.

use anyhow::Result;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::config::MappingConfig;
use crate::error::AutotestError;
use crate::file_index::KnownFiles;

type ResolveFn = dyn Fn(&str, &Captures<'_>, &KnownFiles) -> Vec<String> + Send + Sync;

pub struct MappingRule {
    pattern: Regex,
    resolve: Box<ResolveFn>,
}

impl MappingRule {
    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }
}

impl fmt::Debug for MappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingRule").field("pattern", &self.pattern.as_str()).finish()
    }
}

#[derive(Debug, Default)]
pub struct MappingResolver {
    rules: Vec<MappingRule>,
}

impl MappingResolver {
    /// A resolver with no rules at all
    pub fn new() -> Self {
        Self::default()
    }

    /// The generic lib/ -> test/ rules
    pub fn with_defaults() -> Result<Self> {
        let mut resolver = Self::new();

        // file in lib/ -> test_<name>.rb or <name>_test.rb under test/, underscores optional
        resolver.add_rule(Regex::new(r"^lib/.*\.rb$")?, false, |path, _, known| {
            let basename = path.rsplit('/').next().unwrap_or(path);
            let stem = basename.strip_suffix(".rb").unwrap_or(basename);
            let possible = stem.split('_').map(regex::escape).collect::<Vec<_>>().join("_?");
            match Regex::new(&format!(r"^test/.*(?:{0}\.rb|{0}_test\.rb)$", possible)) {
                Ok(re) => known.files_matching(&re),
                Err(_) => Vec::new(),
            }
        });

        // a test file runs itself
        resolver.add_rule(Regex::new(r"^test.*/(test_.*|.*_test)\.rb$")?, false, |path, _, _| {
            vec![path.to_string()]
        });

        Ok(resolver)
    }

    pub fn add_rule<F>(&mut self, pattern: Regex, prepend: bool, resolve: F)
    where
        F: Fn(&str, &Captures<'_>, &KnownFiles) -> Vec<String> + Send + Sync + 'static,
    {
        let rule = MappingRule {
            pattern,
            resolve: Box::new(resolve),
        };

        if prepend {
            self.rules.insert(0, rule);
        } else {
            self.rules.push(rule);
        }
    }

    /// Drop every rule whose pattern source equals `pattern`
    pub fn remove_rule(&mut self, pattern: &str) {
        self.rules.retain(|rule| rule.pattern.as_str() != pattern);
    }

    /// Removes everything, including the defaults. Nothing will map until a rule is added back.
    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// Register `[[mapping]]` entries from the configuration
    pub fn add_configured(&mut self, mappings: &[MappingConfig]) -> Result<()> {
        for mapping in mappings {
            let pattern = Regex::new(&mapping.pattern).map_err(|source| AutotestError::InvalidPattern {
                pattern: mapping.pattern.clone(),
                source,
            })?;
            let templates = mapping.tests.clone();

            self.add_rule(pattern, mapping.prepend, move |path, caps, known| {
                templates
                    .iter()
                    .flat_map(|template| known.files_matching_glob(&expand_template(template, path, caps)))
                    .collect()
            });
        }

        Ok(())
    }

    /// Test files implicated by a change to `path`, sorted and de-duplicated
    pub fn resolve(&self, path: &str, known: &KnownFiles) -> Vec<String> {
        for rule in &self.rules {
            let Some(caps) = rule.pattern.captures(path) else {
                continue;
            };

            let mut result: Vec<String> = (rule.resolve)(path, &caps, known)
                .into_iter()
                .filter(|f| known.contains(f))
                .collect();
            result.sort();
            result.dedup();

            if !result.is_empty() {
                tracing::debug!(path, rule = rule.pattern.as_str(), tests = ?result, "mapped");
                return result;
            }
        }

        tracing::debug!(path, "no tests matched");
        Vec::new()
    }
}

/// `{0}`..`{9}` -> capture groups, `{basename}` -> file stem
fn expand_template(template: &str, path: &str, caps: &Captures<'_>) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut out = template.replace("{basename}", &stem);
    for i in 0..10 {
        let key = format!("{{{}}}", i);
        if out.contains(&key) {
            let value = caps.get(i).map_or("", |m| m.as_str());
            out = out.replace(&key, value);
        }
    }
    out
}

/// `test/foo_bar/test_baz2.rb` -> `TestFooBar::TestBaz2`
pub fn path_to_classname(path: &str) -> String {
    let trimmed = path.strip_prefix("test/").unwrap_or(path);
    let trimmed = trimmed.strip_suffix(".rb").unwrap_or(trimmed);

    trimmed
        .split('/')
        .map(|segment| {
            let name: String = split_words(segment).iter().map(|w| capitalize(w)).collect();
            if name.starts_with("Test") {
                name
            } else {
                format!("Test{}", name)
            }
        })
        .collect::<Vec<_>>()
        .join("::")
}

/// Split on underscores and around digit runs, keeping the digits
fn split_words(segment: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;

    for c in segment.chars() {
        if c == '_' {
            words.push(std::mem::take(&mut current));
            in_digits = false;
            continue;
        }

        let is_digit = c.is_ascii_digit();
        if !current.is_empty() && is_digit != in_digits {
            words.push(std::mem::take(&mut current));
        }
        in_digits = is_digit;
        current.push(c);
    }
    words.push(current);

    words.into_iter().filter(|w| !w.is_empty()).collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Test class name -> test file, for every known file under test/
pub fn class_map(known: &KnownFiles, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = known
        .paths()
        .iter()
        .filter(|f| f.starts_with("test"))
        .map(|f| (path_to_classname(f), f.clone()))
        .collect();

    map.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    map
}
