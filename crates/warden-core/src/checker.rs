//! Permission checker
//!
//! A pure oracle over the permissions snapshot: does client C hold operation
//! O on account path P? Globs are deliberately narrow: `*` matches any path,
//! `wallet/*` matches any account in the wallet, and anything else is an
//! exact path. The default is deny.

use crate::{Error, Operation, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One grant: a path pattern and the operations allowed on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub path: String,
    pub operations: Vec<Operation>,
}

pub struct Checker {
    access: HashMap<String, Vec<Permission>>,
}

impl Checker {
    /// Build from the configured client → grants map, validating patterns
    pub fn new(access: HashMap<String, Vec<Permission>>) -> Result<Self> {
        for (client, permissions) in &access {
            for permission in permissions {
                if !valid_pattern(&permission.path) {
                    return Err(Error::Invalid(format!(
                        "permission pattern {:?} for client {client} is not *, wallet/* or wallet/account",
                        permission.path
                    )));
                }
            }
        }
        Ok(Self { access })
    }

    /// Whether the client may perform the operation on the path
    pub fn check(&self, client: &str, path: &str, operation: Operation) -> bool {
        let Some(permissions) = self.access.get(client) else {
            return false;
        };
        permissions.iter().any(|permission| {
            path_matches(&permission.path, path) && permission.operations.contains(&operation)
        })
    }

    /// Clients with at least one grant, for diagnostics
    pub fn clients(&self) -> Vec<&str> {
        self.access.keys().map(String::as_str).collect()
    }

    /// Grants for a client, for diagnostics
    pub fn permissions(&self, client: &str) -> &[Permission] {
        self.access.get(client).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn valid_pattern(pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('/') {
        Some((wallet, rest)) => {
            !wallet.is_empty()
                && !wallet.contains('*')
                && !rest.is_empty()
                && (rest == "*" || !rest.contains('*'))
                && !rest.contains('/')
        }
        None => false,
    }
}

fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix("/*") {
        Some(wallet) => path
            .split_once('/')
            .is_some_and(|(path_wallet, _)| path_wallet == wallet),
        None => pattern == path,
    }
}
