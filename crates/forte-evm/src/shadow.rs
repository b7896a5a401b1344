//! Shadow execution: differential comparison against the reference
//! interpreter
//!
//! Per-call mode runs the reference once over the same message and compares
//! final results. Per-step mode drives the reference in lockstep from the
//! dispatch loop's step hooks and compares after every operation, stopping
//! at the first divergence. Comparison only reads; neither engine's state
//! is ever mutated by the comparator itself.

use crate::context::Environment;
use crate::error::{EvmError, EvmResult};
use crate::frame::Frame;
use crate::host::{
    CallParams, CallResult, CallScope, Host, Log, SnapshotId,
};
use crate::inspector::Inspector;
use crate::mini::MiniEvm;
use crate::rules::ChainRules;
use bytes::Bytes;
use forte_primitives::{Address, H256};

/// Shadow operating mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShadowMode {
    /// No shadow execution
    Off,
    /// Run the reference once per top-level call, compare final results
    #[default]
    PerCall,
    /// Drive the reference in lockstep, compare after every step
    PerStep,
}

/// Shadow configuration, injected at the execution entry
#[derive(Clone, Debug)]
pub struct ShadowConfig {
    /// Operating mode
    pub mode: ShadowMode,
    /// Stack entries compared per step (from the top)
    pub stack_compare_limit: usize,
    /// Bytes of context captured in mismatch summaries
    pub memory_window: usize,
    /// Fail the call on divergence instead of recording it
    pub halt_on_mismatch: bool,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            mode: ShadowMode::PerCall,
            stack_compare_limit: 16,
            memory_window: 64,
            halt_on_mismatch: false,
        }
    }
}

/// Which comparison produced a mismatch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MismatchContext {
    /// Final-result comparison
    PerCall,
    /// Lockstep comparison
    PerStep,
}

/// First field found to differ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MismatchField {
    /// Success flags differ
    Success,
    /// Gas remaining differs
    GasLeft,
    /// Output bytes differ
    Output,
    /// Emitted logs differ
    Logs,
    /// Storage contents differ
    Storage,
    /// Stack depth or entries differ
    Stack,
    /// Memory contents differ
    Memory,
    /// Program counters differ
    Pc,
}

impl MismatchField {
    /// Stable wire name
    pub fn as_str(self) -> &'static str {
        match self {
            MismatchField::Success => "success",
            MismatchField::GasLeft => "gas_left",
            MismatchField::Output => "output",
            MismatchField::Logs => "logs",
            MismatchField::Storage => "storage",
            MismatchField::Stack => "stack",
            MismatchField::Memory => "memory",
            MismatchField::Pc => "pc",
        }
    }
}

/// One detected divergence between the engines
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowMismatch {
    /// Comparison context
    pub context: MismatchContext,
    /// Program counter of the diverging operation (per-step only)
    pub pc: Option<usize>,
    /// First differing field
    pub field: MismatchField,
    /// Bounded summary of the primary engine's value
    pub left: String,
    /// Bounded summary of the reference's value
    pub right: String,
}

impl ShadowMismatch {
    /// One-line description for logs and errors
    pub fn summary(&self) -> String {
        match self.pc {
            Some(pc) => format!(
                "{} at pc {}: primary {} != reference {}",
                self.field.as_str(),
                pc,
                self.left,
                self.right
            ),
            None => format!(
                "{}: primary {} != reference {}",
                self.field.as_str(),
                self.left,
                self.right
            ),
        }
    }
}

fn bounded_hex(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        format!("0x{}", hex::encode(bytes))
    } else {
        format!(
            "0x{} (+{} bytes)",
            hex::encode(&bytes[..limit]),
            bytes.len() - limit
        )
    }
}

/// Compare the final results of a call executed by both engines.
///
/// Checks success, gas left, then output; the first difference is reported
/// and later fields are not examined.
pub fn compare_call_results(
    primary: &CallResult,
    reference: &CallResult,
    config: &ShadowConfig,
) -> Option<ShadowMismatch> {
    let mismatch = |field, left, right| {
        Some(ShadowMismatch {
            context: MismatchContext::PerCall,
            pc: None,
            field,
            left,
            right,
        })
    };
    if primary.success != reference.success {
        return mismatch(
            MismatchField::Success,
            primary.success.to_string(),
            reference.success.to_string(),
        );
    }
    if primary.gas_left != reference.gas_left {
        return mismatch(
            MismatchField::GasLeft,
            primary.gas_left.to_string(),
            reference.gas_left.to_string(),
        );
    }
    if primary.output != reference.output {
        return mismatch(
            MismatchField::Output,
            bounded_hex(&primary.output, config.memory_window),
            bounded_hex(&reference.output, config.memory_window),
        );
    }
    None
}

/// Compare engine states after both executed the operation at `primary_pc`.
///
/// Checks program counter alignment, gas remaining (block-adjusted on the
/// primary side), stack depth, then the top
/// `min(stack_compare_limit, depth)` entries, in that order.
pub fn compare_step(
    frame: &Frame,
    reference: &MiniEvm,
    primary_pc: usize,
    reference_pc: usize,
    config: &ShadowConfig,
) -> Option<ShadowMismatch> {
    let mismatch = |field, left, right| {
        Some(ShadowMismatch {
            context: MismatchContext::PerStep,
            pc: Some(primary_pc),
            field,
            left,
            right,
        })
    };
    if primary_pc != reference_pc {
        return mismatch(
            MismatchField::Pc,
            primary_pc.to_string(),
            reference_pc.to_string(),
        );
    }
    let primary_gas = frame.block_adjusted_gas();
    if primary_gas != reference.gas() {
        return mismatch(
            MismatchField::GasLeft,
            primary_gas.to_string(),
            reference.gas().to_string(),
        );
    }
    let left_depth = frame.stack().len();
    let right_depth = reference.stack().len();
    if left_depth != right_depth {
        return mismatch(
            MismatchField::Stack,
            format!("depth {left_depth}"),
            format!("depth {right_depth}"),
        );
    }
    for i in 0..config.stack_compare_limit.min(left_depth) {
        let left = frame.stack().peek_at(i).ok()?;
        let right = reference.stack().peek_at(i).ok()?;
        if left != right {
            return mismatch(
                MismatchField::Stack,
                format!("[{i}] = {left:#x}"),
                format!("[{i}] = {right:#x}"),
            );
        }
    }
    None
}

/// Read-only host view for the lockstep reference: reads pass through,
/// writes and log emission are swallowed (the primary already applied the
/// identical effects one half-step earlier), and nested calls answer with
/// the result captured from the primary's `message-after` hook so no call
/// runs twice.
struct ShadowHostView<'a> {
    inner: &'a mut dyn Host,
    pending_call: Option<CallResult>,
}

impl Host for ShadowHostView<'_> {
    fn get_storage(&self, address: &Address, slot: &H256) -> H256 {
        self.inner.get_storage(address, slot)
    }

    fn set_storage(&mut self, _address: Address, _slot: H256, _value: H256) {}

    fn get_original_storage(&self, address: &Address, slot: &H256) -> H256 {
        self.inner.get_original_storage(address, slot)
    }

    fn get_balance(&self, address: &Address) -> forte_primitives::U256 {
        self.inner.get_balance(address)
    }

    fn get_nonce(&self, address: &Address) -> u64 {
        self.inner.get_nonce(address)
    }

    fn get_code(&self, address: &Address) -> Bytes {
        self.inner.get_code(address)
    }

    fn call(&mut self, _params: &CallParams, _scope: CallScope<'_, '_>) -> CallResult {
        self.pending_call
            .take()
            .unwrap_or_else(|| CallResult::failure(0))
    }

    fn emit_log(&mut self, _log: Log) {}

    fn create_snapshot(&mut self) -> SnapshotId {
        0
    }

    fn revert_to_snapshot(&mut self, _id: SnapshotId) {}

    fn record_storage_change(
        &mut self,
        _snapshot: SnapshotId,
        _address: Address,
        _slot: H256,
        _original: H256,
    ) {
    }
}

/// Drives the reference interpreter in lockstep with the primary loop.
///
/// Attached to exactly one frame; nested calls are answered from captured
/// results rather than followed. Only the first divergence is retained.
pub struct ShadowRunner {
    mini: MiniEvm,
    config: ShadowConfig,
    mismatch: Option<ShadowMismatch>,
    pending_call: Option<CallResult>,
}

impl ShadowRunner {
    /// Build a runner for a message about to execute `code`.
    ///
    /// Fails with `FeatureDisabled` unless the configuration selects
    /// per-step mode.
    pub fn new(code: Bytes, params: &CallParams, config: ShadowConfig) -> EvmResult<Self> {
        if config.mode != ShadowMode::PerStep {
            return Err(EvmError::FeatureDisabled(
                "shadow runner requires per_step mode",
            ));
        }
        Ok(Self {
            mini: MiniEvm::for_params(code, params)?,
            config,
            mismatch: None,
            pending_call: None,
        })
    }

    /// The first divergence found, if any
    pub fn last_mismatch(&self) -> Option<&ShadowMismatch> {
        self.mismatch.as_ref()
    }

    /// Take the first divergence found, if any
    pub fn take_mismatch(&mut self) -> Option<ShadowMismatch> {
        self.mismatch.take()
    }

    #[cfg(test)]
    pub(crate) fn mini_mut(&mut self) -> &mut MiniEvm {
        &mut self.mini
    }

    /// Capture a nested call's result before the host releases it
    pub fn on_message_after(&mut self, result: &CallResult) {
        if self.mismatch.is_none() {
            self.pending_call = Some(result.clone());
        }
    }

    /// Called by the loop after the primary executed the operation at `pc`:
    /// steps the reference over the same operation and compares states.
    pub fn after_step(
        &mut self,
        frame: &Frame,
        pc: usize,
        host: &mut dyn Host,
        env: &Environment,
        rules: &ChainRules,
    ) -> EvmResult<()> {
        // Lockstep stops at the first divergence
        if self.mismatch.is_some() {
            return Ok(());
        }

        let reference_pc = self.mini.pc();
        if reference_pc != pc {
            self.mismatch = Some(ShadowMismatch {
                context: MismatchContext::PerStep,
                pc: Some(pc),
                field: MismatchField::Pc,
                left: pc.to_string(),
                right: reference_pc.to_string(),
            });
            return self.settle();
        }

        let mut view = ShadowHostView {
            inner: host,
            pending_call: self.pending_call.take(),
        };
        let stepped = self.mini.step(&mut view, env, rules);
        self.pending_call = view.pending_call.take();

        if let Err(err) = stepped {
            self.mismatch = Some(ShadowMismatch {
                context: MismatchContext::PerStep,
                pc: Some(pc),
                field: MismatchField::Success,
                left: "ok".to_string(),
                right: err.to_string(),
            });
            return self.settle();
        }

        self.mismatch = compare_step(frame, &self.mini, pc, reference_pc, &self.config);
        self.settle()
    }

    fn settle(&mut self) -> EvmResult<()> {
        match &self.mismatch {
            Some(mismatch) if self.config.halt_on_mismatch => {
                Err(EvmError::ShadowMismatch(mismatch.summary()))
            }
            _ => Ok(()),
        }
    }
}

/// Run a message on both engines and compare the final results.
///
/// The reference executes first against a snapshot that is rolled back, so
/// the primary's effects are the ones that persist.
pub fn run_per_call(
    host: &mut dyn Host,
    env: &Environment,
    rules: &ChainRules,
    params: &CallParams,
    inspector: Option<&mut (dyn Inspector + '_)>,
    config: &ShadowConfig,
) -> (CallResult, Option<ShadowMismatch>) {
    let reference = params.target().and_then(|target| {
        let code = host.get_code(&target);
        let mut mini = MiniEvm::for_params(code, params).ok()?;
        let snapshot = host.create_snapshot();
        let result = mini.run(host, env, rules);
        host.revert_to_snapshot(snapshot);
        Some(result)
    });

    let primary = host.call(
        params,
        CallScope {
            inspector,
            shadow: None,
            depth: 0,
            static_context: false,
            env,
            rules,
        },
    );

    let mismatch = reference
        .as_ref()
        .and_then(|reference| compare_call_results(&primary, reference, config));
    (primary, mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool, gas_left: u64, output: Vec<u8>) -> CallResult {
        CallResult {
            success,
            gas_left,
            output,
            created: None,
            error: None,
        }
    }

    #[test]
    fn test_compare_call_results_equal() {
        let config = ShadowConfig::default();
        let a = result(true, 100, vec![1, 2, 3]);
        let b = result(true, 100, vec![1, 2, 3]);
        assert_eq!(compare_call_results(&a, &b, &config), None);
    }

    #[test]
    fn test_compare_call_results_priority_order() {
        let config = ShadowConfig::default();

        // Success differs: later fields are not examined
        let a = result(true, 100, vec![1]);
        let b = result(false, 200, vec![2]);
        let mismatch = compare_call_results(&a, &b, &config).unwrap();
        assert_eq!(mismatch.field, MismatchField::Success);
        assert_eq!(mismatch.context, MismatchContext::PerCall);
        assert_eq!(mismatch.pc, None);

        // Same success, gas differs before output
        let a = result(true, 100, vec![1]);
        let b = result(true, 200, vec![2]);
        let mismatch = compare_call_results(&a, &b, &config).unwrap();
        assert_eq!(mismatch.field, MismatchField::GasLeft);

        // Only output differs
        let a = result(true, 100, vec![1]);
        let b = result(true, 100, vec![2]);
        let mismatch = compare_call_results(&a, &b, &config).unwrap();
        assert_eq!(mismatch.field, MismatchField::Output);
    }

    #[test]
    fn test_bounded_hex_truncates() {
        assert_eq!(bounded_hex(&[0xAB, 0xCD], 4), "0xabcd");
        let long = vec![0xFF; 10];
        let summary = bounded_hex(&long, 4);
        assert!(summary.starts_with("0xffffffff"));
        assert!(summary.contains("+6 bytes"));
    }

    #[test]
    fn test_mismatch_summary() {
        let mismatch = ShadowMismatch {
            context: MismatchContext::PerStep,
            pc: Some(7),
            field: MismatchField::GasLeft,
            left: "100".into(),
            right: "97".into(),
        };
        assert_eq!(
            mismatch.summary(),
            "gas_left at pc 7: primary 100 != reference 97"
        );
    }

    #[test]
    fn test_runner_requires_per_step_mode() {
        let params = CallParams::Call {
            caller: Address::ZERO,
            target: Address::ZERO,
            value: forte_primitives::U256::zero(),
            gas: 1000,
            input: Bytes::new(),
        };
        let config = ShadowConfig {
            mode: ShadowMode::PerCall,
            ..Default::default()
        };
        assert!(matches!(
            ShadowRunner::new(Bytes::new(), &params, config),
            Err(EvmError::FeatureDisabled(_))
        ));
    }

    #[test]
    fn test_field_wire_names() {
        assert_eq!(MismatchField::GasLeft.as_str(), "gas_left");
        assert_eq!(MismatchField::Pc.as_str(), "pc");
        assert_eq!(MismatchField::Success.as_str(), "success");
    }
}
