//! User and group models for the access directory.

use serde::{Deserialize, Serialize};

/// A login allowed to read, post or administer topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl User {
    pub fn new(login: &str, groups: &[&str]) -> Self {
        Self {
            login: login.to_string(),
            description: String::new(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            password_hash: String::new(),
            enabled: true,
        }
    }
}

/// A named group that permission entries can refer to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
}
