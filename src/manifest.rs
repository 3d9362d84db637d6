//! Userscript manifest header parsing and name normalization
//!
//! Scripts may start with a header block:
//!
//! ```text
//! // ==UserScript==
//! // @name        GitHub Tweaks
//! // @match       https://github.com/*
//! // @description Small fixes for the PR page
//! // @run-at      document-end
//! // @inject      scittle://reagent.js
//! // ==/UserScript==
//! ```
//!
//! `@name` and at least one `@match` are required for a script to be saved.
//! Unknown keys such as `@version` or `@author` are ignored.

use crate::error::CrudError;
use globset::{Glob, GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

/// Suffix every normalized script name carries
pub const SCRIPT_SUFFIX: &str = ".js";

const HEADER_OPEN: &str = "==UserScript==";
const HEADER_CLOSE: &str = "==/UserScript==";

lazy_static::lazy_static! {
    static ref HEADER_LINE: Regex = Regex::new(r"^//\s*@([A-Za-z][\w-]*)(?:\s+(.*?))?\s*$")
        .expect("header line regex is valid");
    static ref NON_IDENT: Regex = Regex::new(r"[^a-z0-9]+").expect("identifier regex is valid");
    static ref MATCH_PATTERN: Regex =
        Regex::new(r"^(\*|https?|file|ftp)://(\*|\*\.[^/*]+|[^/*]*)(/.*)$")
            .expect("match pattern regex is valid");
}

/// When a script runs relative to page load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    #[default]
    DocumentIdle,
}

impl RunAt {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "document-start" => Some(RunAt::DocumentStart),
            "document-end" => Some(RunAt::DocumentEnd),
            "document-idle" => Some(RunAt::DocumentIdle),
            _ => None,
        }
    }
}

/// Fields declared by a script's header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub display_name: String,
    pub matches: Vec<String>,
    pub description: Option<String>,
    pub run_at: RunAt,
    pub inject: Vec<String>,
}

impl Manifest {
    /// Parse and validate the header of `code`
    pub fn parse(code: &str) -> Result<Self, CrudError> {
        let lines = header_lines(code)?;

        let mut display_name: Option<String> = None;
        let mut matches = Vec::new();
        let mut description = None;
        let mut run_at = None;
        let mut inject = Vec::new();

        for line in lines {
            let Some(caps) = HEADER_LINE.captures(line) else {
                continue;
            };
            let key = &caps[1];
            let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();

            match key {
                "name" => {
                    if display_name.is_some() {
                        return Err(CrudError::validation("@name", "declared more than once"));
                    }
                    display_name = Some(value.to_string());
                }
                "match" => {
                    MatchPattern::parse(value)?;
                    matches.push(value.to_string());
                }
                "description" if !value.is_empty() => description = Some(value.to_string()),
                "run-at" => {
                    let parsed = RunAt::parse(value).ok_or_else(|| {
                        CrudError::validation("@run-at", format!("unknown timing '{}'", value))
                    })?;
                    run_at = Some(parsed);
                }
                "inject" if !value.is_empty() => {
                    if !inject.iter().any(|i| i == value) {
                        inject.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        let display_name = display_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CrudError::validation("@name", "missing script name"))?;

        if matches.is_empty() {
            return Err(CrudError::validation(
                "@match",
                "at least one URL match pattern is required",
            ));
        }

        Ok(Self {
            display_name,
            matches,
            description,
            run_at: run_at.unwrap_or_default(),
            inject,
        })
    }

    /// Normalized store key for this manifest
    pub fn script_name(&self) -> Result<String, CrudError> {
        normalize(&self.display_name)
    }
}

/// Collect the `//` lines between the header markers.
///
/// Only blank lines may precede the opening marker.
fn header_lines(code: &str) -> Result<Vec<&str>, CrudError> {
    let mut lines = code.lines().map(str::trim).skip_while(|l| l.is_empty());

    match lines.next() {
        Some(first) if is_marker(first, HEADER_OPEN) => {}
        _ => {
            return Err(CrudError::validation(
                "manifest",
                "script must begin with a // ==UserScript== header",
            ));
        }
    }

    let mut collected = Vec::new();
    for line in lines {
        if is_marker(line, HEADER_CLOSE) {
            return Ok(collected);
        }
        collected.push(line);
    }

    Err(CrudError::validation(
        "manifest",
        "header is missing the closing // ==/UserScript== line",
    ))
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.strip_prefix("//")
        .map(|rest| rest.trim() == marker)
        .unwrap_or(false)
}

/// Derive the canonical store key from a display name.
///
/// Lowercases, collapses every run of non-alphanumerics to `_` inside each
/// `/`-separated segment and appends [`SCRIPT_SUFFIX`]. Idempotent on keys.
pub fn normalize(display_name: &str) -> Result<String, CrudError> {
    let lowered = display_name.trim().to_lowercase();
    let stem = lowered.strip_suffix(SCRIPT_SUFFIX).unwrap_or(&lowered);

    let segments: Vec<String> = stem
        .split('/')
        .map(|segment| NON_IDENT.replace_all(segment, "_").trim_matches('_').to_string())
        .filter(|segment| !segment.is_empty())
        .collect();

    if segments.is_empty() {
        return Err(CrudError::validation(
            "name",
            format!("'{}' does not contain any usable characters", display_name),
        ));
    }

    Ok(format!("{}{}", segments.join("/"), SCRIPT_SUFFIX))
}

/// A compiled URL match pattern
#[derive(Debug, Clone)]
pub struct MatchPattern {
    raw: String,
    kind: PatternKind,
}

#[derive(Debug, Clone)]
enum PatternKind {
    AllUrls,
    Url {
        scheme: String,
        host: HostPattern,
        path: GlobMatcher,
    },
}

#[derive(Debug, Clone)]
enum HostPattern {
    Any,
    Subdomains(String),
    Exact(String),
}

impl MatchPattern {
    pub fn parse(pattern: &str) -> Result<Self, CrudError> {
        if pattern == "<all_urls>" {
            return Ok(Self {
                raw: pattern.to_string(),
                kind: PatternKind::AllUrls,
            });
        }

        let caps = MATCH_PATTERN.captures(pattern).ok_or_else(|| {
            CrudError::validation("@match", format!("invalid match pattern '{}'", pattern))
        })?;

        let scheme = caps[1].to_string();
        let host = match &caps[2] {
            "*" => HostPattern::Any,
            h if h.starts_with("*.") => HostPattern::Subdomains(h[2..].to_lowercase()),
            "" if scheme != "file" => {
                return Err(CrudError::validation(
                    "@match",
                    format!("match pattern '{}' has no host", pattern),
                ));
            }
            h => HostPattern::Exact(h.to_lowercase()),
        };

        let glob = caps[3]
            .split('*')
            .map(globset::escape)
            .collect::<Vec<_>>()
            .join("*");
        let path = GlobBuilder::new(&glob)
            .literal_separator(false)
            .build()
            .map(|g: Glob| g.compile_matcher())
            .map_err(|e| CrudError::validation("@match", e.to_string()))?;

        Ok(Self {
            raw: pattern.to_string(),
            kind: PatternKind::Url { scheme, host, path },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, url: &Url) -> bool {
        let url_scheme = url.scheme();
        match &self.kind {
            PatternKind::AllUrls => matches!(url_scheme, "http" | "https" | "file" | "ftp"),
            PatternKind::Url { scheme, host, path } => {
                let scheme_ok = match scheme.as_str() {
                    "*" => matches!(url_scheme, "http" | "https"),
                    s => s == url_scheme,
                };
                if !scheme_ok {
                    return false;
                }

                let url_host = url.host_str().unwrap_or_default().to_lowercase();
                let host_ok = match host {
                    HostPattern::Any => true,
                    HostPattern::Subdomains(base) => {
                        url_host == *base || url_host.ends_with(&format!(".{}", base))
                    }
                    HostPattern::Exact(h) => url_host == *h,
                };
                if !host_ok {
                    return false;
                }

                let mut target = url.path().to_string();
                if let Some(query) = url.query() {
                    target.push('?');
                    target.push_str(query);
                }
                path.is_match(&target)
            }
        }
    }
}

/// Compiled patterns keyed by their source text
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<String, Arc<MatchPattern>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `pattern` once and share it afterwards. Failures are not cached.
    pub fn get(&self, pattern: &str) -> Result<Arc<MatchPattern>, CrudError> {
        if let Some(hit) = self.lock().get(pattern) {
            return Ok(Arc::clone(hit));
        }

        let compiled = Arc::new(MatchPattern::parse(pattern)?);
        Ok(Arc::clone(
            self.lock()
                .entry(pattern.to_string())
                .or_insert(compiled),
        ))
    }

    /// Drop patterns no longer referenced by `live`
    pub fn retain<'a>(&self, live: impl IntoIterator<Item = &'a str>) {
        let live: std::collections::HashSet<&str> = live.into_iter().collect();
        self.lock().retain(|k, _| live.contains(k.as_str()));
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.lock().contains_key(pattern)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<MatchPattern>>> {
        self.compiled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
