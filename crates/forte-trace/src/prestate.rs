//! Prestate tracer: pre/post account-state capture
//!
//! Watches every storage/balance/code observation flowing through the hook
//! layer, lazily building a prestate map of first-observed values per
//! touched account and a chronological change log. At finalization the
//! poststate is the prestate replayed forward through the change log.

use bytes::Bytes;
use forte_evm::{CallOutcome, EvmResult, Inspector, StateTouch, StepResult};
use forte_primitives::{Address, H256, U256};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Prestate tracer options
#[derive(Clone, Debug)]
pub struct PrestateConfig {
    /// Report `{pre, post}` instead of the prestate alone
    pub diff_mode: bool,
    /// Capture account code
    pub capture_code: bool,
    /// Capture storage slots
    pub capture_storage: bool,
}

impl Default for PrestateConfig {
    fn default() -> Self {
        Self {
            diff_mode: false,
            capture_code: true,
            capture_storage: true,
        }
    }
}

/// First-observed state of one touched account
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountState {
    /// Balance at first observation
    pub balance: Option<U256>,
    /// Nonce at first observation
    pub nonce: Option<u64>,
    /// Code at first observation
    pub code: Option<Bytes>,
    /// Storage slots at first observation
    pub storage: BTreeMap<H256, H256>,
}

/// One entry of the chronological change log
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    /// A storage slot was written
    StorageWrite {
        /// Account written
        address: Address,
        /// Slot written
        slot: H256,
        /// New value
        value: H256,
    },
    /// An account was created
    AccountCreated {
        /// The new account
        address: Address,
    },
}

/// Captures prestate and poststate maps keyed by touched accounts
#[derive(Debug, Default)]
pub struct PrestateTracer {
    config: PrestateConfig,
    pre: BTreeMap<Address, AccountState>,
    changes: Vec<StateChange>,
    finalized: bool,
}

impl PrestateTracer {
    /// Tracer with default options
    pub fn new() -> Self {
        Self::with_config(PrestateConfig::default())
    }

    /// Tracer with explicit options
    pub fn with_config(config: PrestateConfig) -> Self {
        Self {
            config,
            pre: BTreeMap::new(),
            changes: Vec::new(),
            finalized: false,
        }
    }

    /// The prestate map: first-observed values per touched account
    pub fn prestate(&self) -> &BTreeMap<Address, AccountState> {
        &self.pre
    }

    /// The chronological change log
    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    /// Whether the traced call has completed
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The poststate map: prestate replayed through the change log
    pub fn poststate(&self) -> BTreeMap<Address, AccountState> {
        let mut post = self.pre.clone();
        for change in &self.changes {
            match change {
                StateChange::StorageWrite {
                    address,
                    slot,
                    value,
                } => {
                    post.entry(*address).or_default().storage.insert(*slot, *value);
                }
                StateChange::AccountCreated { address } => {
                    let account = post.entry(*address).or_default();
                    account.nonce.get_or_insert(1);
                }
            }
        }
        post
    }

    fn account_json(&self, state: &AccountState) -> Value {
        let mut account = Map::new();
        account.insert(
            "balance".to_string(),
            json!(format!("{:#x}", state.balance.unwrap_or_default())),
        );
        account.insert("nonce".to_string(), json!(state.nonce.unwrap_or(0)));
        if self.config.capture_code {
            if let Some(code) = state.code.as_ref().filter(|code| !code.is_empty()) {
                account.insert("code".to_string(), json!(format!("0x{}", hex::encode(code))));
            }
        }
        if self.config.capture_storage && !state.storage.is_empty() {
            let storage: Map<String, Value> = state
                .storage
                .iter()
                .map(|(slot, value)| (slot.to_hex(), json!(value.to_hex())))
                .collect();
            account.insert("storage".to_string(), Value::Object(storage));
        }
        Value::Object(account)
    }

    fn state_json(&self, state: &BTreeMap<Address, AccountState>) -> Value {
        let accounts: Map<String, Value> = state
            .iter()
            .map(|(address, account)| (address.to_hex(), self.account_json(account)))
            .collect();
        Value::Object(accounts)
    }

    /// The report in the documented JSON shape: an object keyed by touched
    /// addresses, or `{pre, post}` in diff mode
    pub fn report(&self) -> Value {
        if self.config.diff_mode {
            json!({
                "pre": self.state_json(&self.pre),
                "post": self.state_json(&self.poststate()),
            })
        } else {
            self.state_json(&self.pre)
        }
    }

    fn observe(&mut self, touch: &StateTouch) {
        match touch {
            StateTouch::StorageRead {
                address,
                slot,
                value,
            } => {
                if self.config.capture_storage {
                    self.pre
                        .entry(*address)
                        .or_default()
                        .storage
                        .entry(*slot)
                        .or_insert(*value);
                }
            }
            StateTouch::StorageWrite {
                address,
                slot,
                original,
                value,
            } => {
                if self.config.capture_storage {
                    self.pre
                        .entry(*address)
                        .or_default()
                        .storage
                        .entry(*slot)
                        .or_insert(*original);
                }
                self.changes.push(StateChange::StorageWrite {
                    address: *address,
                    slot: *slot,
                    value: *value,
                });
            }
            StateTouch::BalanceRead { address, value } => {
                let account = self.pre.entry(*address).or_default();
                account.balance.get_or_insert(*value);
            }
            StateTouch::CodeRead { address, code } => {
                if self.config.capture_code {
                    let account = self.pre.entry(*address).or_default();
                    if account.code.is_none() {
                        account.code = Some(code.clone());
                    }
                }
            }
            StateTouch::AccountCreated { address } => {
                // A created account has no prestate beyond its absence
                self.pre.entry(*address).or_default();
                self.changes.push(StateChange::AccountCreated { address: *address });
            }
        }
    }
}

impl Inspector for PrestateTracer {
    fn step_after(&mut self, step: &StepResult<'_>) -> EvmResult<()> {
        for touch in step.touches {
            self.observe(touch);
        }
        Ok(())
    }

    fn finalize(&mut self, outcome: &CallOutcome<'_>) -> EvmResult<()> {
        self.finalized = true;
        tracing::debug!(
            accounts = self.pre.len(),
            changes = self.changes.len(),
            failed = outcome.failed,
            "prestate capture finalized"
        );
        Ok(())
    }
}
