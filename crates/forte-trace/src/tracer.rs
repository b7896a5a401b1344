//! Standard tracer: structured step log and call tree

use forte_evm::{
    CallOutcome, CallParams, CallResult, EvmResult, Inspector, StepResult,
};
use serde::Serialize;

/// Capture bounds for the standard tracer.
///
/// When a bound is exceeded the tracer truncates and records a dropped
/// count; it never fails the traced execution.
#[derive(Clone, Debug)]
pub struct TracerConfig {
    /// Maximum stack entries captured per step
    pub stack_max_items: usize,
    /// Maximum memory bytes captured per step
    pub memory_max_bytes: usize,
    /// Maximum log-data bytes captured per emitted log
    pub log_data_max_bytes: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            stack_max_items: 32,
            memory_max_bytes: 4096,
            log_data_max_bytes: 1024,
        }
    }
}

/// Bounded memory snapshot around the region a step touched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryWindow {
    /// Byte offset of the first captured byte
    pub offset: usize,
    /// Captured bytes
    pub bytes: Vec<u8>,
}

/// One structured trace line.
///
/// The serialized field set is append-only across versions: existing names
/// and types never change. The `stack` array is bottom-first; the top of
/// the stack is the last element. When truncated, only the topmost entries
/// are kept and `stackDropped` counts the omitted bottom entries.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructLog {
    /// Program counter
    pub pc: u64,
    /// Opcode byte, `"0xNN"`
    pub op: String,
    /// Gas before the step, hex
    pub gas: String,
    /// Apparent step cost, hex (distorted by block pre-charging for
    /// operations sharing a block with neighbors)
    pub gas_cost: String,
    /// Stack entries after the step, bottom-first, minimal hex
    pub stack: Vec<String>,
    /// Call depth
    pub depth: u32,
    /// Memory size in bytes after the step
    pub mem_size: u64,
    /// Opcode mnemonic
    pub op_name: String,
    /// Stack entries omitted by the capture bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_dropped: Option<usize>,
    /// Gas after the step; not part of the wire format
    #[serde(skip)]
    pub gas_after: u64,
    /// Bounded memory snapshot; not part of the wire format
    #[serde(skip)]
    pub memory: Option<MemoryWindow>,
}

/// Log entry captured during tracing, with bounded data
#[derive(Clone, Debug)]
pub struct CapturedLog {
    /// Step index the log was emitted at
    pub step: usize,
    /// Emitting contract, hex
    pub address: String,
    /// Topics, hex
    pub topics: Vec<String>,
    /// Log data, truncated to the configured bound
    pub data: Vec<u8>,
    /// Bytes dropped by the bound
    pub data_dropped: usize,
}

/// Terminal state of a call-tree node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    /// Call still executing
    Pending,
    /// Call completed normally
    Success,
    /// Call failed or reverted
    Revert,
}

/// One node of the traced call tree.
///
/// Step ranges are half-open `[startStep, endStep)` in the tracer's global
/// step counter; child ranges nest strictly inside their parent's.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameNode {
    /// Node id (index in the tree)
    pub id: usize,
    /// Parent node id, `None` for the root
    pub parent: Option<usize>,
    /// Nesting depth
    pub depth: u32,
    /// Call kind (one of the six kinds)
    pub kind: &'static str,
    /// Calling contract, hex
    pub caller: String,
    /// Called contract, hex; `None` while a created address is pending
    pub callee: Option<String>,
    /// Value carried, hex
    pub value: String,
    /// Gas forwarded to the callee
    pub gas_forwarded: u64,
    /// Input size in bytes
    pub input_size: usize,
    /// Output size in bytes
    pub output_size: usize,
    /// Truncated output, hex
    pub output_preview: String,
    /// First step executed inside this call
    pub start_step: usize,
    /// One past the last step of this call; set at completion
    pub end_step: Option<usize>,
    /// Terminal state
    pub status: FrameStatus,
}

const OUTPUT_PREVIEW_BYTES: usize = 32;

/// Accumulates a structured step log and a call tree
#[derive(Debug, Default)]
pub struct StandardTracer {
    config: TracerConfig,
    steps: Vec<StructLog>,
    captured_logs: Vec<CapturedLog>,
    frames: Vec<FrameNode>,
    open: Vec<usize>,
    step_counter: usize,
    gas_used: Option<u64>,
}

impl StandardTracer {
    /// Tracer with default bounds
    pub fn new() -> Self {
        Self::with_config(TracerConfig::default())
    }

    /// Tracer with explicit bounds
    pub fn with_config(config: TracerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Recorded step log
    pub fn struct_logs(&self) -> &[StructLog] {
        &self.steps
    }

    /// Recorded call tree
    pub fn frame_nodes(&self) -> &[FrameNode] {
        &self.frames
    }

    /// Captured log entries
    pub fn captured_logs(&self) -> &[CapturedLog] {
        &self.captured_logs
    }

    /// Total gas reported at finalize, once finalized
    pub fn gas_used(&self) -> Option<u64> {
        self.gas_used
    }

    /// The step log as an append-only stream of JSON lines
    pub fn to_json_lines(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            // StructLog contains nothing a serializer can reject
            if let Ok(line) = serde_json::to_string(step) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    /// The call tree as a JSON array
    pub fn call_tree_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.frames).unwrap_or_default()
    }

    fn capture_stack(&self, stack: &forte_evm::Stack) -> (Vec<String>, Option<usize>) {
        let items = stack.items();
        let dropped = items.len().saturating_sub(self.config.stack_max_items);
        let captured = items[dropped..]
            .iter()
            .map(|item| format!("{item:#x}"))
            .collect();
        (captured, (dropped > 0).then_some(dropped))
    }

    fn capture_memory(&self, step: &StepResult<'_>) -> Option<MemoryWindow> {
        let data = step.memory.data();
        let bound = self.config.memory_max_bytes;
        if data.len() <= bound {
            return Some(MemoryWindow {
                offset: 0,
                bytes: data.to_vec(),
            });
        }
        // Memory exceeds the bound: capture a window around the touched
        // region instead of the whole region
        let (touch_offset, touch_len) = step.memory_written?;
        let slack = bound.saturating_sub(touch_len.min(bound)) / 2;
        let start = touch_offset.saturating_sub(slack).min(data.len());
        let end = (start + bound).min(data.len());
        Some(MemoryWindow {
            offset: start,
            bytes: data[start..end].to_vec(),
        })
    }
}

impl Inspector for StandardTracer {
    fn step_after(&mut self, step: &StepResult<'_>) -> EvmResult<()> {
        let (stack, stack_dropped) = self.capture_stack(step.stack);
        let memory = self.capture_memory(step);
        self.steps.push(StructLog {
            pc: step.pc as u64,
            op: format!("0x{:02x}", step.op as u8),
            gas: format!("{:#x}", step.gas_before),
            gas_cost: format!("{:#x}", step.gas_cost),
            stack,
            depth: step.depth,
            mem_size: step.memory.size() as u64,
            op_name: step.op.name().to_string(),
            stack_dropped,
            gas_after: step.gas_after,
            memory,
        });

        for log in step.logs {
            let bound = self.config.log_data_max_bytes;
            let kept = log.data.len().min(bound);
            self.captured_logs.push(CapturedLog {
                step: self.step_counter,
                address: log.address.to_hex(),
                topics: log.topics.iter().map(|t| t.to_hex()).collect(),
                data: log.data[..kept].to_vec(),
                data_dropped: log.data.len() - kept,
            });
        }

        self.step_counter += 1;
        Ok(())
    }

    fn message_before(&mut self, params: &CallParams) -> EvmResult<()> {
        let id = self.frames.len();
        let parent = self.open.last().copied();
        self.frames.push(FrameNode {
            id,
            parent,
            depth: self.open.len() as u32,
            kind: params.kind().as_str(),
            caller: params.caller().to_hex(),
            callee: params.target().map(|a| a.to_hex()),
            value: format!("{:#x}", params.value()),
            gas_forwarded: params.gas(),
            input_size: params.input().len(),
            output_size: 0,
            output_preview: "0x".to_string(),
            start_step: self.step_counter,
            end_step: None,
            status: FrameStatus::Pending,
        });
        self.open.push(id);
        Ok(())
    }

    fn message_after(&mut self, result: &CallResult) -> EvmResult<()> {
        if let Some(id) = self.open.pop() {
            let preview_len = result.output.len().min(OUTPUT_PREVIEW_BYTES);
            let node = &mut self.frames[id];
            node.end_step = Some(self.step_counter);
            node.status = if result.success {
                FrameStatus::Success
            } else {
                FrameStatus::Revert
            };
            node.output_size = result.output.len();
            node.output_preview = format!("0x{}", hex::encode(&result.output[..preview_len]));
            if node.callee.is_none() {
                node.callee = result.created.map(|a| a.to_hex());
            }
        }
        Ok(())
    }

    fn finalize(&mut self, outcome: &CallOutcome<'_>) -> EvmResult<()> {
        self.gas_used = Some(outcome.gas_used);
        tracing::debug!(
            steps = self.steps.len(),
            frames = self.frames.len(),
            gas_used = outcome.gas_used,
            failed = outcome.failed,
            "trace finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use forte_evm::{CallParams, ChainRules, Environment, Evm, MockHost};
    use forte_primitives::{Address, U256};

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    fn trace_code(code: Vec<u8>, gas: u64, config: TracerConfig) -> (StandardTracer, bool) {
        let mut host = MockHost::new();
        host.set_code(addr(2), code);
        let mut evm = Evm::new(Environment::default(), ChainRules::default());
        let mut tracer = StandardTracer::with_config(config);
        let params = CallParams::Call {
            caller: addr(1),
            target: addr(2),
            value: U256::zero(),
            gas,
            input: Bytes::new(),
        };
        let result = evm
            .execute(&mut host, &params, Some(&mut tracer), None)
            .unwrap();
        (tracer, result.success)
    }

    #[test]
    fn test_step_log_scenario() {
        // PUSH1 2, PUSH1 3, ADD, POP, STOP: four entries, depths 1,2,1,0
        let (tracer, success) = trace_code(
            vec![0x60, 0x02, 0x60, 0x03, 0x01, 0x50, 0x00],
            1000,
            TracerConfig::default(),
        );
        assert!(success);
        let logs = tracer.struct_logs();
        assert_eq!(logs.len(), 4);

        let names: Vec<&str> = logs.iter().map(|l| l.op_name.as_str()).collect();
        assert_eq!(names, vec!["PUSH1", "PUSH1", "ADD", "POP"]);
        let depths: Vec<usize> = logs.iter().map(|l| l.stack.len()).collect();
        assert_eq!(depths, vec![1, 2, 1, 0]);

        // pc and op byte of the first entry
        assert_eq!(logs[0].pc, 0);
        assert_eq!(logs[0].op, "0x60");
    }

    #[test]
    fn test_last_entry_gas_after_matches_finalize() {
        let (tracer, success) = trace_code(
            vec![0x60, 0x02, 0x60, 0x03, 0x01, 0x50, 0x00],
            1000,
            TracerConfig::default(),
        );
        assert!(success);
        let gas_used = tracer.gas_used().unwrap();
        let last = tracer.struct_logs().last().unwrap();
        assert_eq!(last.gas_after, 1000 - gas_used);
    }

    #[test]
    fn test_json_line_format() {
        let (tracer, _) = trace_code(
            vec![0x60, 0x2A, 0x60, 0x00, 0x52, 0x00],
            100_000,
            TracerConfig::default(),
        );
        let lines = tracer.to_json_lines();
        let first: serde_json::Value =
            serde_json::from_str(lines.lines().next().unwrap()).unwrap();

        assert_eq!(first["pc"], 0);
        assert_eq!(first["op"], "0x60");
        assert_eq!(first["opName"], "PUSH1");
        // Call depth is zero-based: the top-level frame traces at depth 0
        assert_eq!(first["depth"], 0);
        assert!(first["gas"].as_str().unwrap().starts_with("0x"));
        assert!(first["gasCost"].as_str().unwrap().starts_with("0x"));
        assert!(first["stack"].is_array());
        assert!(first["memSize"].is_number());

        // Stack is bottom-first: after PUSH1 0x2A the only entry is 0x2a
        assert_eq!(first["stack"][0], "0x2a");
    }

    #[test]
    fn test_stack_capture_bound() {
        // Push 8 values; capture at most 3 (the topmost)
        let mut code = Vec::new();
        for i in 1..=8 {
            code.push(0x60);
            code.push(i);
        }
        code.push(0x00);
        let (tracer, _) = trace_code(
            code,
            100_000,
            TracerConfig {
                stack_max_items: 3,
                ..Default::default()
            },
        );
        let last = tracer.struct_logs().last().unwrap();
        assert_eq!(last.stack.len(), 3);
        assert_eq!(last.stack_dropped, Some(5));
        // Topmost entries survive, bottom-first order preserved
        assert_eq!(last.stack, vec!["0x6", "0x7", "0x8"]);
    }

    #[test]
    fn test_memory_capture_bound() {
        // Touch memory far out; snapshots must never exceed the bound
        // PUSH1 0x42, PUSH2 0x2000, MSTORE, STOP
        let code = vec![0x60, 0x42, 0x61, 0x20, 0x00, 0x52, 0x00];
        let bound = 64;
        let (tracer, success) = trace_code(
            code,
            1_000_000,
            TracerConfig {
                memory_max_bytes: bound,
                ..Default::default()
            },
        );
        assert!(success);
        for step in tracer.struct_logs() {
            if let Some(window) = &step.memory {
                assert!(window.bytes.len() <= bound);
            }
        }
        // The MSTORE step captured a window containing the stored byte
        let mstore = tracer
            .struct_logs()
            .iter()
            .find(|l| l.op_name == "MSTORE")
            .unwrap();
        let window = mstore.memory.as_ref().unwrap();
        assert!(window.offset <= 0x2000 + 31);
        assert!(window.bytes.contains(&0x42));
    }

    #[test]
    fn test_log_data_capture_bound() {
        // Store 64 bytes, LOG0 them with a 16-byte capture bound
        // PUSH1 1 PUSH1 0 MSTORE (word 1) PUSH1 2 PUSH1 32 MSTORE (word 2)
        // PUSH1 64 PUSH1 0 LOG0 STOP
        let code = vec![
            0x60, 0x01, 0x60, 0x00, 0x52, 0x60, 0x02, 0x60, 0x20, 0x52, 0x60, 0x40, 0x60, 0x00,
            0xA0, 0x00,
        ];
        let (tracer, success) = trace_code(
            code,
            1_000_000,
            TracerConfig {
                log_data_max_bytes: 16,
                ..Default::default()
            },
        );
        assert!(success);
        let captured = tracer.captured_logs();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].data.len(), 16);
        assert_eq!(captured[0].data_dropped, 48);
    }

    #[test]
    fn test_call_tree_root_node() {
        let (tracer, _) = trace_code(vec![0x00], 1000, TracerConfig::default());
        let frames = tracer.frame_nodes();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0);
        assert_eq!(frames[0].parent, None);
        assert_eq!(frames[0].depth, 0);
        assert_eq!(frames[0].kind, "call");
        assert_eq!(frames[0].status, FrameStatus::Success);
        assert_eq!(frames[0].start_step, 0);
        assert_eq!(frames[0].end_step, Some(0));
    }

    fn call_contract_code(target: Address) -> Vec<u8> {
        let mut code = vec![
            0x60, 0x00, // retLen
            0x60, 0x00, // retOffset
            0x60, 0x00, // argsLen
            0x60, 0x00, // argsOffset
            0x60, 0x00, // value
            0x73, // PUSH20
        ];
        code.extend_from_slice(target.as_bytes());
        code.extend_from_slice(&[0x61, 0xFF, 0xFF, 0xF1, 0x00]);
        code
    }

    #[test]
    fn test_call_tree_child_revert_scenario() {
        // Child reverts; its node reads revert while the parent's own
        // status stays success
        let mut host = MockHost::new();
        let callee = addr(0xCC);
        let caller_contract = addr(0xAA);
        host.set_code(callee, vec![0x60, 0x00, 0x60, 0x00, 0xFD]);
        host.set_code(caller_contract, call_contract_code(callee));

        let mut evm = Evm::new(Environment::default(), ChainRules::default());
        let mut tracer = StandardTracer::new();
        let params = CallParams::Call {
            caller: addr(1),
            target: caller_contract,
            value: U256::zero(),
            gas: 200_000,
            input: Bytes::new(),
        };
        let result = evm
            .execute(&mut host, &params, Some(&mut tracer), None)
            .unwrap();
        assert!(result.success);

        let frames = tracer.frame_nodes();
        assert_eq!(frames.len(), 2);

        let root = &frames[0];
        let child = &frames[1];
        assert_eq!(root.status, FrameStatus::Success);
        assert_eq!(child.status, FrameStatus::Revert);
        assert_eq!(child.parent, Some(0));
        assert_eq!(child.depth, 1);
        assert_eq!(child.kind, "call");
        assert_eq!(child.caller, caller_contract.to_hex());
        assert_eq!(child.callee, Some(callee.to_hex()));
    }

    #[test]
    fn test_call_tree_ranges_nest() {
        let mut host = MockHost::new();
        let callee = addr(0xCC);
        let caller_contract = addr(0xAA);
        host.set_code(callee, vec![0x60, 0x01, 0x50, 0x00]);
        host.set_code(caller_contract, call_contract_code(callee));

        let mut evm = Evm::new(Environment::default(), ChainRules::default());
        let mut tracer = StandardTracer::new();
        let params = CallParams::Call {
            caller: addr(1),
            target: caller_contract,
            value: U256::zero(),
            gas: 200_000,
            input: Bytes::new(),
        };
        evm.execute(&mut host, &params, Some(&mut tracer), None)
            .unwrap();

        let frames = tracer.frame_nodes();
        for node in frames {
            if let Some(parent) = node.parent {
                let parent = &frames[parent];
                assert!(parent.start_step <= node.start_step);
                assert!(node.end_step.unwrap() <= parent.end_step.unwrap());
            }
        }
    }

    #[test]
    fn test_call_tree_json_format() {
        let (tracer, _) = trace_code(vec![0x00], 1000, TracerConfig::default());
        let tree = tracer.call_tree_json();
        let node = &tree[0];
        assert_eq!(node["id"], 0);
        assert_eq!(node["parent"], serde_json::Value::Null);
        assert_eq!(node["kind"], "call");
        assert_eq!(node["status"], "success");
        assert!(node["caller"].as_str().unwrap().starts_with("0x"));
        assert!(node["value"].as_str().unwrap().starts_with("0x"));
        assert!(node["startStep"].is_number());
        assert!(node["endStep"].is_number());
        assert!(node["outputPreview"].as_str().unwrap().starts_with("0x"));
    }

    #[test]
    fn test_output_preview_truncated() {
        // Return 64 bytes; the preview keeps 32
        let code = vec![
            0x60, 0x01, 0x60, 0x00, 0x52, // MSTORE word 1
            0x60, 0x40, 0x60, 0x00, 0xF3, // RETURN 64 bytes
        ];
        let (tracer, success) = trace_code(code, 100_000, TracerConfig::default());
        assert!(success);
        let root = &tracer.frame_nodes()[0];
        assert_eq!(root.output_size, 64);
        // "0x" + 32 bytes of hex
        assert_eq!(root.output_preview.len(), 2 + 64);
    }
}
