//! Account lister
//!
//! Resolves path expressions (`wallet`, `wallet/*`, `wallet/account`) against
//! the fetcher index and filters the results by the caller's
//! `access-account` permission.

use crate::checker::Checker;
use crate::fetcher::Fetcher;
use crate::{ClientContext, Operation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Listing entry for one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub path: String,
    /// Compressed public key, hex-encoded on the wire
    pub public_key: Vec<u8>,
    pub distributed: bool,
}

pub struct Lister {
    checker: Arc<Checker>,
    fetcher: Arc<Fetcher>,
}

impl Lister {
    pub fn new(checker: Arc<Checker>, fetcher: Arc<Fetcher>) -> Self {
        Self { checker, fetcher }
    }

    /// Accounts matching any of the path expressions that the client may
    /// access, sorted by path
    pub fn list_accounts(&self, client: &ClientContext, paths: &[String]) -> Vec<AccountSummary> {
        let mut results: Vec<AccountSummary> = self
            .fetcher
            .accounts()
            .into_iter()
            .filter(|account| {
                let path = account.path().to_string();
                paths.iter().any(|expression| matches(expression, &path))
                    && self
                        .checker
                        .check(&client.name, &path, Operation::AccessAccount)
            })
            .map(|account| AccountSummary {
                path: account.path().to_string(),
                public_key: account.public_key().to_vec(),
                distributed: account.is_distributed(),
            })
            .collect();
        results.sort_by(|a, b| a.path.cmp(&b.path));
        results
    }
}

// A bare wallet name lists the whole wallet.
fn matches(expression: &str, path: &str) -> bool {
    match expression.split_once('/') {
        None => path
            .split_once('/')
            .is_some_and(|(wallet, _)| wallet == expression),
        Some((wallet, "*")) => path
            .split_once('/')
            .is_some_and(|(path_wallet, _)| path_wallet == wallet),
        Some(_) => expression == path,
    }
}
