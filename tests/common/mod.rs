//! Common test utilities and helpers for repowatch tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use repowatch::config::Config;

/// Scratch directory holding a test database
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("data").join("repos.db")
    }

    /// Config pointing at a mock GitHub API and this environment's database
    pub fn config(&self, api_base: &str, account: &str) -> Config {
        let mut config = Config::default();
        config.account = account.to_string();
        config.interval = "1s".to_string();
        config.store.path = self.db_path().to_string_lossy().into_owned();
        config.github.api_base = api_base.to_string();
        config.github.timeout = 5;
        config.metrics.enabled = false;
        config
    }
}

/// A repository object the way GitHub lists it, extra fields included
pub fn repo_json(full_name: &str, created_at: &str) -> Value {
    let name = full_name.rsplit('/').next().unwrap_or(full_name);
    json!({
        "id": 1296269,
        "name": name,
        "full_name": full_name,
        "private": false,
        "fork": false,
        "created_at": created_at,
        "updated_at": created_at,
    })
}

/// `count` generated repositories for one page
pub fn generated_page(owner: &str, page: usize, count: usize) -> Value {
    Value::Array(
        (0..count)
            .map(|i| repo_json(&format!("{}/repo-{}-{}", owner, page, i), "2020-01-01T00:00:00Z"))
            .collect(),
    )
}

/// Listing page response. `page` is the 1-based page number GitHub sees.
pub fn page_mock(account: &str, page: usize, body: Value) -> Mock {
    Mock::given(method("GET"))
        .and(path(format!("/users/{}/repos", account)))
        .and(query_param("per_page", "100"))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
}

/// Account summary response
pub fn summary_mock(account: &str, public_repos: u64) -> Mock {
    Mock::given(method("GET"))
        .and(path(format!("/users/{}", account)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "login": account,
            "id": 583231,
            "type": "User",
            "public_repos": public_repos,
        })))
}
