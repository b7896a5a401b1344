//! Host interface: the boundary between the engine and persistent state
//!
//! The core never persists anything itself. Storage, balances, code, log
//! collection and snapshot/revert live behind the [`Host`] trait; nested
//! calls are dispatched to the host, which re-enters the interpreter with a
//! fresh frame.

use crate::analysis::analyze;
use crate::context::Environment;
use crate::error::EvmError;
use crate::frame::{Frame, FrameInput};
use crate::inspector::Inspector;
use crate::interpreter::execute_frame;
use crate::rules::ChainRules;
use bytes::Bytes;
use forte_crypto::keccak256;
use forte_primitives::{Address, H256, U256};
use std::collections::HashMap;

/// Identifier of a host-held state checkpoint
pub type SnapshotId = usize;

/// Log entry emitted by LOG opcodes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Log {
    /// Contract address that emitted the log
    pub address: Address,
    /// Log topics (0-4)
    pub topics: Vec<H256>,
    /// Log data
    pub data: Vec<u8>,
}

/// The six call kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// Plain message call
    Call,
    /// Execute target code with the caller's storage
    CallCode,
    /// Execute target code with the caller's full context
    DelegateCall,
    /// Read-only message call
    StaticCall,
    /// Contract creation
    Create,
    /// Contract creation with deterministic address
    Create2,
}

impl CallKind {
    /// Wire name used in call-tree JSON
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Call => "call",
            CallKind::CallCode => "callcode",
            CallKind::DelegateCall => "delegatecall",
            CallKind::StaticCall => "staticcall",
            CallKind::Create => "create",
            CallKind::Create2 => "create2",
        }
    }
}

/// Parameters of one call or create message. Immutable once constructed.
#[derive(Clone, Debug)]
pub enum CallParams {
    /// Plain message call
    Call {
        /// Calling contract
        caller: Address,
        /// Called contract
        target: Address,
        /// Value transferred
        value: U256,
        /// Gas forwarded
        gas: u64,
        /// Call data
        input: Bytes,
    },
    /// Execute the target's code against the caller's storage
    CallCode {
        /// Calling contract (also the storage context)
        caller: Address,
        /// Contract supplying the code
        target: Address,
        /// Apparent value
        value: U256,
        /// Gas forwarded
        gas: u64,
        /// Call data
        input: Bytes,
    },
    /// Execute the target's code in the caller's full context
    DelegateCall {
        /// Storage and address context (the delegating contract)
        context: Address,
        /// Caller inherited from the delegating frame
        caller: Address,
        /// Contract supplying the code
        target: Address,
        /// Value inherited from the delegating frame
        value: U256,
        /// Gas forwarded
        gas: u64,
        /// Call data
        input: Bytes,
    },
    /// Read-only message call
    StaticCall {
        /// Calling contract
        caller: Address,
        /// Called contract
        target: Address,
        /// Gas forwarded
        gas: u64,
        /// Call data
        input: Bytes,
    },
    /// Contract creation
    Create {
        /// Creating contract
        caller: Address,
        /// Endowment
        value: U256,
        /// Gas forwarded
        gas: u64,
        /// Initialization code
        init_code: Bytes,
    },
    /// Contract creation with deterministic address (CREATE2)
    Create2 {
        /// Creating contract
        caller: Address,
        /// Endowment
        value: U256,
        /// Gas forwarded
        gas: u64,
        /// Initialization code
        init_code: Bytes,
        /// Address derivation salt
        salt: H256,
    },
}

impl CallParams {
    /// The call kind tag
    pub fn kind(&self) -> CallKind {
        match self {
            CallParams::Call { .. } => CallKind::Call,
            CallParams::CallCode { .. } => CallKind::CallCode,
            CallParams::DelegateCall { .. } => CallKind::DelegateCall,
            CallParams::StaticCall { .. } => CallKind::StaticCall,
            CallParams::Create { .. } => CallKind::Create,
            CallParams::Create2 { .. } => CallKind::Create2,
        }
    }

    /// Gas forwarded to the callee
    pub fn gas(&self) -> u64 {
        match self {
            CallParams::Call { gas, .. }
            | CallParams::CallCode { gas, .. }
            | CallParams::DelegateCall { gas, .. }
            | CallParams::StaticCall { gas, .. }
            | CallParams::Create { gas, .. }
            | CallParams::Create2 { gas, .. } => *gas,
        }
    }

    /// Calling contract
    pub fn caller(&self) -> Address {
        match self {
            CallParams::Call { caller, .. }
            | CallParams::CallCode { caller, .. }
            | CallParams::DelegateCall { caller, .. }
            | CallParams::StaticCall { caller, .. }
            | CallParams::Create { caller, .. }
            | CallParams::Create2 { caller, .. } => *caller,
        }
    }

    /// Value carried by the message (zero for static calls)
    pub fn value(&self) -> U256 {
        match self {
            CallParams::Call { value, .. }
            | CallParams::CallCode { value, .. }
            | CallParams::DelegateCall { value, .. }
            | CallParams::Create { value, .. }
            | CallParams::Create2 { value, .. } => *value,
            CallParams::StaticCall { .. } => U256::zero(),
        }
    }

    /// Called contract, `None` for creates (address pending)
    pub fn target(&self) -> Option<Address> {
        match self {
            CallParams::Call { target, .. }
            | CallParams::CallCode { target, .. }
            | CallParams::DelegateCall { target, .. }
            | CallParams::StaticCall { target, .. } => Some(*target),
            CallParams::Create { .. } | CallParams::Create2 { .. } => None,
        }
    }

    /// Input bytes (call data or init code)
    pub fn input(&self) -> &Bytes {
        match self {
            CallParams::Call { input, .. }
            | CallParams::CallCode { input, .. }
            | CallParams::DelegateCall { input, .. }
            | CallParams::StaticCall { input, .. } => input,
            CallParams::Create { init_code, .. } | CallParams::Create2 { init_code, .. } => {
                init_code
            }
        }
    }

    /// Whether this is a create-family message
    pub fn is_create(&self) -> bool {
        matches!(self, CallParams::Create { .. } | CallParams::Create2 { .. })
    }
}

/// Result of one call or create message.
///
/// The output is a caller-owned copy; the producing frame's buffer is never
/// aliased across a call boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallResult {
    /// Whether the message succeeded
    pub success: bool,
    /// Gas left unconsumed by the callee
    pub gas_left: u64,
    /// Return or revert data
    pub output: Vec<u8>,
    /// Address produced by a create-family message
    pub created: Option<Address>,
    /// Terminal error of the callee frame, `None` on success
    pub error: Option<crate::error::EvmError>,
}

impl CallResult {
    /// Successful result
    pub fn success(gas_left: u64, output: Vec<u8>) -> Self {
        Self {
            success: true,
            gas_left,
            output,
            created: None,
            error: None,
        }
    }

    /// Failed result with no output
    pub fn failure(gas_left: u64) -> Self {
        Self {
            success: false,
            gas_left,
            output: Vec::new(),
            created: None,
            error: None,
        }
    }

    /// Reverted result carrying revert data
    pub fn revert(gas_left: u64, output: Vec<u8>) -> Self {
        Self {
            success: false,
            gas_left,
            output,
            created: None,
            error: None,
        }
    }

    /// Failed result with an explicit terminal error
    pub fn failure_with(gas_left: u64, error: EvmError) -> Self {
        Self {
            success: false,
            gas_left,
            output: Vec::new(),
            created: None,
            error: Some(error),
        }
    }
}

/// Per-message context threaded through [`Host::call`]: the observer the
/// nested frame runs under, the depth and static flag it inherits, and the
/// environment and rules of the transaction.
pub struct CallScope<'a, 'i> {
    /// Observer for the nested frame, if any
    pub inspector: Option<&'a mut (dyn Inspector + 'i)>,
    /// Per-step shadow runner; only ever set for the frame it was built for
    pub shadow: Option<&'a mut crate::shadow::ShadowRunner>,
    /// Call depth of the nested frame
    pub depth: u32,
    /// Whether the nested frame executes in a static context
    pub static_context: bool,
    /// Block/transaction environment
    pub env: &'a Environment,
    /// Hardfork rules
    pub rules: &'a ChainRules,
}

/// State backend consumed by the engine.
///
/// Implementations own all persistence; the engine only ever observes and
/// requests mutations through this trait.
pub trait Host {
    /// Current value of a storage slot
    fn get_storage(&self, address: &Address, slot: &H256) -> H256;

    /// Write a storage slot
    fn set_storage(&mut self, address: Address, slot: H256, value: H256);

    /// Value the slot had at the start of the current top-level call
    fn get_original_storage(&self, address: &Address, slot: &H256) -> H256;

    /// Account balance
    fn get_balance(&self, address: &Address) -> U256;

    /// Account nonce
    fn get_nonce(&self, address: &Address) -> u64;

    /// Account code (empty if absent)
    fn get_code(&self, address: &Address) -> Bytes;

    /// Dispatch a nested call or create; the host builds the child frame
    /// and re-enters the interpreter
    fn call(&mut self, params: &CallParams, scope: CallScope<'_, '_>) -> CallResult;

    /// Record a log entry
    fn emit_log(&mut self, log: Log);

    /// Checkpoint the current state
    fn create_snapshot(&mut self) -> SnapshotId;

    /// Roll state back to a checkpoint
    fn revert_to_snapshot(&mut self, id: SnapshotId);

    /// Journal a storage transition observed under `snapshot`, keyed by the
    /// slot's original (start-of-top-level-call) value
    fn record_storage_change(
        &mut self,
        snapshot: SnapshotId,
        address: Address,
        slot: H256,
        original: H256,
    );
}

/// The low 20 bytes of a Keccak digest, as contract addresses are derived
fn address_from_hash_tail(hash: H256) -> Address {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash.as_bytes()[12..]);
    Address::from_bytes(bytes)
}

/// In-memory account record used by [`MockHost`]
#[derive(Clone, Debug, Default)]
pub struct MockAccount {
    /// Balance in wei
    pub balance: U256,
    /// Nonce
    pub nonce: u64,
    /// Deployed code
    pub code: Bytes,
}

impl MockAccount {
    /// Whether the account is non-empty (EIP-161 sense)
    pub fn exists(&self) -> bool {
        self.nonce > 0 || !self.code.is_empty() || !self.balance.is_zero()
    }
}

#[derive(Clone, Debug)]
struct MockSnapshot {
    accounts: HashMap<Address, MockAccount>,
    storage: HashMap<(Address, H256), H256>,
    logs_len: usize,
}

/// In-memory [`Host`] used by tests and examples.
///
/// State is held in plain maps; snapshots clone the maps wholesale, which is
/// fine at test scale. Nested calls analyze the callee's code and re-enter
/// the interpreter recursively.
pub struct MockHost {
    accounts: HashMap<Address, MockAccount>,
    storage: HashMap<(Address, H256), H256>,
    /// First-observed pre-write value per slot in the current transaction
    original: HashMap<(Address, H256), H256>,
    logs: Vec<Log>,
    snapshots: Vec<MockSnapshot>,
}

impl MockHost {
    /// Create an empty host
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            storage: HashMap::new(),
            original: HashMap::new(),
            logs: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Install code for an account
    pub fn set_code(&mut self, address: Address, code: impl Into<Bytes>) {
        self.accounts.entry(address).or_default().code = code.into();
    }

    /// Set an account balance
    pub fn set_balance(&mut self, address: Address, balance: U256) {
        self.accounts.entry(address).or_default().balance = balance;
    }

    /// Seed a storage slot (also becomes its original value)
    pub fn set_storage_slot(&mut self, address: Address, slot: H256, value: H256) {
        self.storage.insert((address, slot), value);
    }

    /// Logs emitted so far
    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    /// Account record, if present
    pub fn account(&self, address: &Address) -> Option<&MockAccount> {
        self.accounts.get(address)
    }

    /// Forget original-value journal entries; call between transactions
    pub fn reset_journal(&mut self) {
        self.original.clear();
    }

    fn transfer(&mut self, from: &Address, to: &Address, value: U256) -> bool {
        if value.is_zero() {
            return true;
        }
        let from_balance = self.get_balance(from);
        if from_balance < value {
            return false;
        }
        self.accounts.entry(*from).or_default().balance = from_balance - value;
        let to_balance = self.get_balance(to);
        self.accounts.entry(*to).or_default().balance = to_balance + value;
        true
    }

    fn derive_create_address(&self, caller: &Address, nonce: u64) -> Address {
        let mut preimage = Vec::with_capacity(28);
        preimage.extend_from_slice(caller.as_bytes());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        address_from_hash_tail(keccak256(&preimage))
    }

    fn derive_create2_address(&self, caller: &Address, salt: &H256, init_code: &[u8]) -> Address {
        let mut preimage = Vec::with_capacity(85);
        preimage.push(0xFF);
        preimage.extend_from_slice(caller.as_bytes());
        preimage.extend_from_slice(salt.as_bytes());
        preimage.extend_from_slice(keccak256(init_code).as_bytes());
        address_from_hash_tail(keccak256(&preimage))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_frame(
        &mut self,
        code: Bytes,
        input: Bytes,
        address: Address,
        caller: Address,
        value: U256,
        gas: u64,
        scope: CallScope<'_, '_>,
        is_static: bool,
        snapshot: SnapshotId,
    ) -> CallResult {
        let analysis = analyze(code.clone(), scope.rules);
        let mut frame = Frame::new(FrameInput {
            code,
            input,
            address,
            caller,
            value,
            gas,
            depth: scope.depth,
            is_static,
            snapshot,
        });
        execute_frame(
            &analysis,
            &mut frame,
            self,
            scope.env,
            scope.rules,
            scope.inspector,
            scope.shadow,
        )
    }

    fn dispatch_create(&mut self, params: &CallParams, scope: CallScope<'_, '_>) -> CallResult {
        let (caller, value, gas, init_code, salt) = match params {
            CallParams::Create {
                caller,
                value,
                gas,
                init_code,
            } => (*caller, *value, *gas, init_code.clone(), None),
            CallParams::Create2 {
                caller,
                value,
                gas,
                init_code,
                salt,
            } => (*caller, *value, *gas, init_code.clone(), Some(*salt)),
            _ => unreachable!("dispatch_create called with a non-create message"),
        };

        let max_code_size = scope.rules.max_code_size;
        if self.get_balance(&caller) < value {
            return CallResult::failure_with(gas, EvmError::InsufficientBalance);
        }

        let nonce = self.get_nonce(&caller);
        let created = match salt {
            Some(salt) => self.derive_create2_address(&caller, &salt, &init_code),
            None => self.derive_create_address(&caller, nonce),
        };
        self.accounts.entry(caller).or_default().nonce = nonce + 1;

        // Address collision consumes all forwarded gas
        if self
            .accounts
            .get(&created)
            .is_some_and(|a| a.nonce > 0 || !a.code.is_empty())
        {
            return CallResult::failure(0);
        }

        let snapshot = self.create_snapshot();
        self.accounts.entry(created).or_default().nonce = 1;
        if !self.transfer(&caller, &created, value) {
            self.revert_to_snapshot(snapshot);
            return CallResult::failure_with(gas, EvmError::InsufficientBalance);
        }

        let result = self.run_frame(
            init_code,
            Bytes::new(),
            created,
            caller,
            value,
            gas,
            scope,
            false,
            snapshot,
        );

        if !result.success {
            self.revert_to_snapshot(snapshot);
            return result;
        }
        if result.output.len() > max_code_size {
            self.revert_to_snapshot(snapshot);
            return CallResult::failure_with(0, EvmError::MaxCodeSizeExceeded);
        }

        self.accounts.entry(created).or_default().code = Bytes::from(result.output);
        CallResult {
            success: true,
            gas_left: result.gas_left,
            // Successful creation returns no data; the new address is the
            // observable result
            output: Vec::new(),
            created: Some(created),
            error: None,
        }
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for MockHost {
    fn get_storage(&self, address: &Address, slot: &H256) -> H256 {
        self.storage
            .get(&(*address, *slot))
            .copied()
            .unwrap_or(H256::ZERO)
    }

    fn set_storage(&mut self, address: Address, slot: H256, value: H256) {
        if value.is_zero() {
            self.storage.remove(&(address, slot));
        } else {
            self.storage.insert((address, slot), value);
        }
    }

    fn get_original_storage(&self, address: &Address, slot: &H256) -> H256 {
        self.original
            .get(&(*address, *slot))
            .copied()
            .unwrap_or_else(|| self.get_storage(address, slot))
    }

    fn get_balance(&self, address: &Address) -> U256 {
        self.accounts
            .get(address)
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    fn get_nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    fn get_code(&self, address: &Address) -> Bytes {
        self.accounts
            .get(address)
            .map(|a| a.code.clone())
            .unwrap_or_default()
    }

    fn call(&mut self, params: &CallParams, scope: CallScope<'_, '_>) -> CallResult {
        if scope.depth > scope.rules.max_call_depth {
            return CallResult::failure_with(params.gas(), EvmError::CallDepthExceeded);
        }
        if params.is_create() {
            return self.dispatch_create(params, scope);
        }

        let snapshot = self.create_snapshot();
        let (code_source, address, caller, value, transfer_to) = match params {
            CallParams::Call {
                caller,
                target,
                value,
                ..
            } => (*target, *target, *caller, *value, Some(*target)),
            CallParams::CallCode {
                caller,
                target,
                value,
                ..
            } => (*target, *caller, *caller, *value, None),
            CallParams::DelegateCall {
                context,
                caller,
                target,
                value,
                ..
            } => (*target, *context, *caller, *value, None),
            CallParams::StaticCall { caller, target, .. } => {
                (*target, *target, *caller, U256::zero(), None)
            }
            CallParams::Create { .. } | CallParams::Create2 { .. } => unreachable!(),
        };

        if let Some(to) = transfer_to {
            if !self.transfer(&params.caller(), &to, value) {
                return CallResult::failure_with(params.gas(), EvmError::InsufficientBalance);
            }
        }

        let code = self.get_code(&code_source);
        let is_static = scope.static_context || params.kind() == CallKind::StaticCall;
        let result = self.run_frame(
            code,
            params.input().clone(),
            address,
            caller,
            value,
            params.gas(),
            scope,
            is_static,
            snapshot,
        );

        if !result.success {
            self.revert_to_snapshot(snapshot);
        }
        result
    }

    fn emit_log(&mut self, log: Log) {
        self.logs.push(log);
    }

    fn create_snapshot(&mut self) -> SnapshotId {
        self.snapshots.push(MockSnapshot {
            accounts: self.accounts.clone(),
            storage: self.storage.clone(),
            logs_len: self.logs.len(),
        });
        self.snapshots.len() - 1
    }

    fn revert_to_snapshot(&mut self, id: SnapshotId) {
        if let Some(snapshot) = self.snapshots.get(id).cloned() {
            self.accounts = snapshot.accounts;
            self.storage = snapshot.storage;
            self.logs.truncate(snapshot.logs_len);
            self.snapshots.truncate(id);
        }
    }

    fn record_storage_change(
        &mut self,
        _snapshot: SnapshotId,
        address: Address,
        slot: H256,
        original: H256,
    ) {
        // Only the first transition per slot matters: `original` is the
        // value at the start of the top-level call
        self.original.entry((address, slot)).or_insert(original);
    }
}
