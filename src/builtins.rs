//! Scripts and libraries shipped with the extension

use crate::error::CrudError;
use crate::manifest::Manifest;
use crate::store::{BUILTIN_ID_PREFIX, ScriptRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Definition of a shipped script
#[derive(Debug, Clone, Copy)]
pub struct BuiltinScript {
    pub id: &'static str,
    pub code: &'static str,
    pub enabled: bool,
    pub hidden: bool,
}

pub const BUILTIN_SCRIPTS: &[BuiltinScript] = &[
    BuiltinScript {
        id: "builtin:gist-installer",
        code: include_str!("../scripts/builtin/gist_installer.js"),
        enabled: true,
        hidden: false,
    },
    BuiltinScript {
        id: "builtin:bridge-diagnostics",
        code: include_str!("../scripts/builtin/bridge_diagnostics.js"),
        enabled: false,
        hidden: true,
    },
];

impl BuiltinScript {
    /// Materialize the shipped definition as a store record
    pub fn to_record(&self) -> Result<ScriptRecord, CrudError> {
        debug_assert!(self.id.starts_with(BUILTIN_ID_PREFIX));
        let manifest = Manifest::parse(self.code)?;
        let name = manifest.script_name()?;
        let now = Utc::now();
        Ok(ScriptRecord {
            id: self.id.to_string(),
            name,
            display_name: manifest.display_name,
            code: self.code.to_string(),
            matches: manifest.matches,
            description: manifest.description,
            run_at: manifest.run_at,
            inject: manifest.inject,
            enabled: self.enabled,
            builtin: true,
            hidden: self.hidden,
            created_at: now,
            modified_at: now,
        })
    }
}

/// A library a script may request through `@inject`
#[derive(Debug, Clone, Copy)]
pub struct Library {
    pub id: &'static str,
    pub files: &'static [&'static str],
    pub requires: &'static [&'static str],
}

pub const LIBRARIES: &[Library] = &[
    Library {
        id: "scittle://react.js",
        files: &["vendor/react.production.min.js", "vendor/react-dom.production.min.js"],
        requires: &[],
    },
    Library {
        id: "scittle://reagent.js",
        files: &["vendor/scittle.reagent.js"],
        requires: &["scittle://react.js"],
    },
    Library {
        id: "scittle://re-frame.js",
        files: &["vendor/scittle.re-frame.js"],
        requires: &["scittle://reagent.js"],
    },
    Library {
        id: "scittle://replicant.js",
        files: &["vendor/scittle.replicant.js"],
        requires: &[],
    },
    Library {
        id: "scittle://pprint.js",
        files: &["vendor/scittle.pprint.js"],
        requires: &[],
    },
    Library {
        id: "scittle://promesa.js",
        files: &["vendor/scittle.promesa.js"],
        requires: &[],
    },
];

pub fn library(id: &str) -> Option<&'static Library> {
    LIBRARIES.iter().find(|l| l.id == id)
}

/// Load plan for a set of requested libraries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    /// Files in the order they must be injected
    pub files: Vec<String>,
    /// Requested identifiers that are not in the catalogue
    pub unknown: Vec<String>,
}

/// Resolve requested library ids to files, dependencies first, each file once
pub fn resolve_libraries<S: AsRef<str>>(requested: &[S]) -> LoadPlan {
    let mut plan = LoadPlan::default();
    let mut visited: Vec<&'static str> = Vec::new();

    fn visit(lib: &'static Library, visited: &mut Vec<&'static str>, plan: &mut LoadPlan) {
        if visited.contains(&lib.id) {
            return;
        }
        visited.push(lib.id);
        for dep in lib.requires {
            if let Some(dep) = library(dep) {
                visit(dep, visited, plan);
            }
        }
        for file in lib.files {
            if !plan.files.iter().any(|f| f == file) {
                plan.files.push(file.to_string());
            }
        }
    }

    for id in requested {
        let id = id.as_ref();
        match library(id) {
            Some(lib) => visit(lib, &mut visited, &mut plan),
            None if !plan.unknown.iter().any(|u| u == id) => plan.unknown.push(id.to_string()),
            None => {}
        }
    }

    plan
}
