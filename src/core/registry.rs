use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::core::errors::SandboxError;

/// How to build and run one language. Templates may reference `{file}`
/// (path of the source file) and `{dir}` (a writable build directory).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub language_id: String,
    pub file_extension: String,
    pub image_ref: String,
    #[serde(default)]
    pub compile_command_template: Option<String>,
    pub run_command_template: String,
}

impl RuntimeDescriptor {
    pub fn source_file_name(&self) -> String {
        format!("main.{}", self.file_extension.trim_start_matches('.'))
    }

    pub fn compile_command(&self, file: &str, dir: &str) -> Option<String> {
        self.compile_command_template
            .as_deref()
            .map(|template| render(template, file, dir))
    }

    pub fn run_command(&self, file: &str, dir: &str) -> String {
        render(&self.run_command_template, file, dir)
    }
}

fn render(template: &str, file: &str, dir: &str) -> String {
    template.replace("{file}", file).replace("{dir}", dir)
}

/// Read-only after construction, shared through `Arc` without locking.
#[derive(Clone, Debug, Default)]
pub struct RuntimeRegistry {
    descriptors: HashMap<String, RuntimeDescriptor>,
}

impl RuntimeRegistry {
    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = RuntimeDescriptor>,
    {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.language_id.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, language_id: &str) -> Result<&RuntimeDescriptor, SandboxError> {
        self.descriptors
            .get(language_id)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language_id.to_string()))
    }

    pub fn languages(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).sorted().collect()
    }

    pub fn default_descriptors() -> Vec<RuntimeDescriptor> {
        vec![
            RuntimeDescriptor {
                language_id: "python".to_string(),
                file_extension: "py".to_string(),
                image_ref: "python:3.11-slim".to_string(),
                compile_command_template: None,
                run_command_template: "python3 -u {file}".to_string(),
            },
            RuntimeDescriptor {
                language_id: "cpp".to_string(),
                file_extension: "cpp".to_string(),
                image_ref: "gcc:13".to_string(),
                compile_command_template: Some(
                    "g++ -O2 -std=c++17 -o {dir}/main {file}".to_string(),
                ),
                run_command_template: "{dir}/main".to_string(),
            },
        ]
    }
}
