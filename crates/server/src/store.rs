// SPDX-License-Identifier: MIT

// boringproxy - Store
// Persistent server state: one JSON document, rewritten on every mutation.
// Callers that need read/modify/write atomicity across several calls hold
// the TunnelRegistry mutex; the Store only guards individual operations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use boringproxy_common::{Error, Result, TokenData, Tunnel, User};

const DB_FILE_NAME: &str = "boringproxy_db.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DbState {
    #[serde(default)]
    admin_domain: String,
    #[serde(default)]
    tokens: BTreeMap<String, TokenData>,
    #[serde(default)]
    tunnels: BTreeMap<String, Tunnel>,
    #[serde(default)]
    users: BTreeMap<String, User>,
}

pub struct Store {
    path: PathBuf,
    state: Mutex<DbState>,
}

impl Store {
    /// Open (or create) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE_NAME);

        let state = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            info!(path = %path.display(), "creating database");
            DbState::default()
        };

        let store = Self {
            path,
            state: Mutex::new(state),
        };
        {
            let state = store.state.lock().unwrap();
            store.persist(&state)?;
        }
        Ok(store)
    }

    fn persist(&self, state: &DbState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn get_tunnel(&self, domain: &str) -> Option<Tunnel> {
        self.state.lock().unwrap().tunnels.get(domain).cloned()
    }

    pub fn get_tunnels(&self) -> BTreeMap<String, Tunnel> {
        self.state.lock().unwrap().tunnels.clone()
    }

    pub fn set_tunnel(&self, domain: &str, tunnel: Tunnel) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tunnels.insert(domain.to_string(), tunnel);
        self.persist(&state)
    }

    pub fn delete_tunnel(&self, domain: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.tunnels.remove(domain).is_none() {
            return Err(Error::TunnelNotFound(domain.to_string()));
        }
        self.persist(&state)
    }

    pub fn get_token_data(&self, token: &str) -> Option<TokenData> {
        self.state.lock().unwrap().tokens.get(token).cloned()
    }

    /// Mint a fresh token for `owner`, optionally scoped to one client.
    pub fn add_token(&self, owner: &str, client: &str) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let mut state = self.state.lock().unwrap();
        state.tokens.insert(
            token.clone(),
            TokenData {
                owner: owner.to_string(),
                client: client.to_string(),
            },
        );
        self.persist(&state)?;
        Ok(token)
    }

    pub fn delete_token_data(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tokens.remove(token);
        self.persist(&state)
    }

    pub fn get_user(&self, name: &str) -> Option<User> {
        self.state.lock().unwrap().users.get(name).cloned()
    }

    pub fn has_users(&self) -> bool {
        !self.state.lock().unwrap().users.is_empty()
    }

    pub fn add_user(&self, name: &str, is_admin: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.users.insert(
            name.to_string(),
            User {
                is_admin,
                clients: Default::default(),
            },
        );
        self.persist(&state)
    }

    pub fn delete_user(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.users.remove(name);
        self.persist(&state)
    }

    /// Record a client name under a user, creating the user if needed.
    pub fn add_client(&self, user: &str, client: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .users
            .entry(user.to_string())
            .or_default()
            .clients
            .insert(client.to_string());
        self.persist(&state)
    }

    pub fn get_admin_domain(&self) -> String {
        self.state.lock().unwrap().admin_domain.clone()
    }

    pub fn set_admin_domain(&self, domain: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.admin_domain = domain.to_string();
        self.persist(&state)
    }
}
