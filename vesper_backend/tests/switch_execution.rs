//! End-to-end switch lowering: build the branch structure for real case
//! sets, then execute it against a simulated register file and check
//! every input reaches the case block the source program says it should.

use rustc_hash::FxHashMap;
use vesper_backend::bailout::BailOutKind;
use vesper_backend::ir::{IRType, Instr, InstrId, IrFunc, MultiBrKind, OpCode, Opnd, SymId};
use vesper_backend::switches::{SwitchAdapter, SwitchBuilder, SwitchProfile};
use vesper_core::intern::{intern, InternedString};

// =============================================================================
// Test adapter
// =============================================================================

#[derive(Default)]
struct RecordingAdapter {
    relocs: Vec<(InstrId, u32)>,
}

impl RecordingAdapter {
    fn target_of(&self, id: InstrId) -> Option<u32> {
        self.relocs.iter().rev().find(|(i, _)| *i == id).map(|(_, t)| *t)
    }
}

impl SwitchAdapter for RecordingAdapter {
    fn add_branch_instr(
        &mut self,
        func: &mut IrFunc,
        instr: Instr,
        offset: u32,
        target_offset: u32,
    ) -> InstrId {
        let id = func.arena.append(instr);
        self.relocs.push((id, target_offset));
        let _ = offset;
        id
    }

    fn add_instr(&mut self, func: &mut IrFunc, instr: Instr, _offset: u32) -> InstrId {
        func.arena.append(instr)
    }

    fn create_reloc_record(
        &mut self,
        _func: &mut IrFunc,
        branch: InstrId,
        _offset: u32,
        target_offset: u32,
    ) {
        self.relocs.push((branch, target_offset));
    }

    fn convert_to_bail_out(&mut self, func: &mut IrFunc, instr: InstrId, kind: BailOutKind) {
        func.arena.instr_mut(instr).convert_to_bailout(kind);
    }
}

// =============================================================================
// Simulator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum SimValue {
    Int(i64),
    Str(InternedString),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimResult {
    /// Execution left the emitted region for this byte-code offset.
    Target(u32),
    /// Execution hit a bailout.
    BailedOut(BailOutKind),
}

struct Simulator<'a> {
    func: &'a IrFunc,
    adapter: &'a RecordingAdapter,
    /// First instruction at each byte-code offset.
    offset_map: FxHashMap<u32, InstrId>,
}

impl<'a> Simulator<'a> {
    fn new(func: &'a IrFunc, adapter: &'a RecordingAdapter) -> Self {
        let mut offset_map = FxHashMap::default();
        for id in func.arena.iter() {
            let offset = func.arena.instr(id).byte_code_offset;
            offset_map.entry(offset).or_insert(id);
        }
        Simulator { func, adapter, offset_map }
    }

    fn const_of(&self, opnd: &Opnd) -> i64 {
        if let Some(v) = opnd.as_int_const() {
            return v;
        }
        if let Some(sym) = opnd.sym() {
            if let Some(v) = self.func.sym(sym).int_const_value() {
                return v;
            }
        }
        panic!("operand is not an integer constant: {:?}", opnd);
    }

    /// Run from `start` with `value` in the switch register.
    ///
    /// A taken branch whose target offset names an emitted instruction
    /// continues there; any other target has reached a case block.
    fn run(&self, start: InstrId, value_sym: SymId, value: SimValue) -> SimResult {
        let mut regs: FxHashMap<SymId, i64> = FxHashMap::default();
        if let SimValue::Int(v) = value {
            regs.insert(value_sym, v);
        }

        let mut cursor = Some(start);
        let mut steps = 0;
        while let Some(id) = cursor {
            steps += 1;
            assert!(steps < 10_000, "simulation diverged");
            let instr = self.func.arena.instr(id);

            let read = |regs: &FxHashMap<SymId, i64>, opnd: &Option<Opnd>| -> i64 {
                match opnd {
                    Some(Opnd::Reg { sym, .. }) => regs.get(sym).copied().unwrap_or(0),
                    Some(other) => self.const_of(other),
                    None => panic!("missing operand"),
                }
            };

            // A taken branch produces Some(offset).
            let mut taken: Option<u32> = None;
            match instr.opcode {
                OpCode::Label | OpCode::Nop | OpCode::Ld => {}
                OpCode::BailOut => {
                    return SimResult::BailedOut(instr.bail_out_kind.expect("bailout kind"));
                }
                OpCode::Sub => {
                    let result = read(&regs, &instr.src1) - read(&regs, &instr.src2);
                    if let Some(Opnd::Reg { sym, .. }) = &instr.dst {
                        regs.insert(*sym, result);
                    }
                }
                OpCode::Br => {
                    taken = Some(self.target_of(id));
                }
                OpCode::BrStrEq => {
                    let case = instr.src2.as_ref().and_then(|o| o.as_str_const());
                    if let (SimValue::Str(s), Some(case)) = (value, case) {
                        if s == case {
                            taken = Some(self.target_of(id));
                        }
                    }
                }
                OpCode::BrEq | OpCode::BrNeq | OpCode::BrLt | OpCode::BrLe | OpCode::BrGt
                | OpCode::BrGe => {
                    // Integer compares against a non-int value never
                    // match (strict equality semantics).
                    if matches!(value, SimValue::Int(_)) {
                        let lhs = read(&regs, &instr.src1);
                        let rhs = read(&regs, &instr.src2);
                        let branch = match instr.opcode {
                            OpCode::BrEq => lhs == rhs,
                            OpCode::BrNeq => lhs != rhs,
                            OpCode::BrLt => lhs < rhs,
                            OpCode::BrLe => lhs <= rhs,
                            OpCode::BrGt => lhs > rhs,
                            OpCode::BrGe => lhs >= rhs,
                            _ => unreachable!(),
                        };
                        if branch {
                            taken = Some(self.target_of(id));
                        }
                    }
                }
                OpCode::MultiBr => {
                    let data = instr.multi_br.as_deref().expect("jump table data");
                    let target = match (data.kind, value) {
                        (MultiBrKind::IntJumpTable, SimValue::Int(_)) => {
                            // Src1 holds the normalized index.
                            let index = read(&regs, &instr.src1);
                            if index < 0 || index as usize >= data.targets.len() {
                                data.default_target
                            } else {
                                data.targets[index as usize]
                            }
                        }
                        (_, SimValue::Str(s)) => data.lookup_str(s),
                        _ => data.default_target,
                    };
                    taken = Some(target);
                }
                other => panic!("unexpected opcode in switch lowering: {:?}", other),
            }

            cursor = match taken {
                Some(offset) => match self.offset_map.get(&offset) {
                    Some(&target_id) => Some(target_id),
                    None => return SimResult::Target(offset),
                },
                None => self.func.arena.next(id),
            };
        }
        panic!("fell off the end of the instruction stream");
    }

    fn target_of(&self, id: InstrId) -> u32 {
        self.adapter.target_of(id).expect("branch without relocation")
    }
}

fn simulate(
    func: &IrFunc,
    adapter: &RecordingAdapter,
    start: InstrId,
    value_sym: SymId,
    value: SimValue,
) -> SimResult {
    Simulator::new(func, adapter).run(start, value_sym, value)
}

// =============================================================================
// Builders
// =============================================================================

struct BuiltSwitch {
    func: IrFunc,
    adapter: RecordingAdapter,
    value_sym: SymId,
    start: InstrId,
}

fn build_int_switch(cases: &[(i32, u32, u32)], default_target: u32) -> BuiltSwitch {
    let mut func = IrFunc::new();
    let mut adapter = RecordingAdapter::default();
    let mut builder = SwitchBuilder::new(false, true);

    let profiled = func.arena.append(Instr::new(OpCode::Ld));
    builder.begin_switch();
    builder.set_profiled_instruction(profiled, SwitchProfile::LikelyTaggedInt);

    let value_sym = func.new_sym(IRType::Var);
    let src1 = Opnd::reg(value_sym, IRType::Var);
    for &(value, offset, target) in cases {
        builder.on_case(&mut func, &mut adapter, src1.clone(), Opnd::int32(value), offset, target);
    }
    builder.end_switch(&mut func, &mut adapter, 900, default_target);

    // Start past the profiled switch instruction (which optimized
    // lowerings convert into the type guard); int inputs model the
    // guard having passed.
    let head = func.arena.head().expect("emitted instructions");
    let start = func.arena.next(head).expect("instructions after the profiled switch");
    BuiltSwitch { func, adapter, value_sym, start }
}

fn run_int(built: &BuiltSwitch, value: i64) -> SimResult {
    simulate(&built.func, &built.adapter, built.start, built.value_sym, SimValue::Int(value))
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_linear_switch_reaches_correct_blocks() {
    // switch (v) { case 1: a; case 2: b; case 100: c; default: d }
    let built = build_int_switch(&[(1, 10, 100), (2, 20, 200), (100, 30, 300)], 400);

    assert_eq!(run_int(&built, 1), SimResult::Target(100));
    assert_eq!(run_int(&built, 2), SimResult::Target(200));
    assert_eq!(run_int(&built, 100), SimResult::Target(300));
    assert_eq!(run_int(&built, 50), SimResult::Target(400));
    assert_eq!(run_int(&built, -7), SimResult::Target(400));
}

#[test]
fn test_binary_search_switch_reaches_correct_blocks() {
    // Sparse values force the binary-search tree.
    let cases: Vec<(i32, u32, u32)> =
        (0..10).map(|i| (i * 37, 10 + i as u32, 1000 + i as u32)).collect();
    let built = build_int_switch(&cases, 5000);

    for i in 0..10 {
        assert_eq!(run_int(&built, (i * 37) as i64), SimResult::Target(1000 + i as u32));
    }
    assert_eq!(run_int(&built, 1), SimResult::Target(5000));
    assert_eq!(run_int(&built, 36), SimResult::Target(5000));
    assert_eq!(run_int(&built, 334), SimResult::Target(5000));
    assert_eq!(run_int(&built, -1), SimResult::Target(5000));
}

#[test]
fn test_jump_table_switch_reaches_correct_blocks() {
    // 64 consecutive values build a jump table.
    let cases: Vec<(i32, u32, u32)> =
        (0..64).map(|i| (i + 5, 10 + i as u32, 1000 + i as u32)).collect();
    let built = build_int_switch(&cases, 5000);

    for i in 0..64 {
        assert_eq!(run_int(&built, (i + 5) as i64), SimResult::Target(1000 + i as u32));
    }
    // Below, above, and far outside the table.
    assert_eq!(run_int(&built, 4), SimResult::Target(5000));
    assert_eq!(run_int(&built, 69), SimResult::Target(5000));
    assert_eq!(run_int(&built, 1_000_000), SimResult::Target(5000));
}

#[test]
fn test_empty_case_range_switch() {
    // Cases 10..=13 share one block; 50 is its own; enough cases to
    // leave the linear path.
    let cases =
        [(10, 10, 100), (11, 11, 100), (12, 12, 100), (13, 13, 100), (50, 14, 200)];
    let built = build_int_switch(&cases, 400);

    for v in 10..=13 {
        assert_eq!(run_int(&built, v), SimResult::Target(100), "value {}", v);
    }
    assert_eq!(run_int(&built, 50), SimResult::Target(200));
    assert_eq!(run_int(&built, 14), SimResult::Target(400));
    assert_eq!(run_int(&built, 9), SimResult::Target(400));
}

#[test]
fn test_string_switch_dictionary_execution() {
    let mut func = IrFunc::new();
    let mut adapter = RecordingAdapter::default();
    let mut builder = SwitchBuilder::new(false, true);

    let profiled = func.arena.append(Instr::new(OpCode::Ld));
    builder.begin_switch();
    builder.set_profiled_instruction(profiled, SwitchProfile::LikelyString);

    let value_sym = func.new_sym(IRType::Var);
    let src1 = Opnd::reg(value_sym, IRType::Var);
    let labels = ["red", "green", "blue", "cyan", "magenta"];
    for (i, label) in labels.iter().enumerate() {
        builder.on_case(
            &mut func,
            &mut adapter,
            src1.clone(),
            Opnd::StrConst { value: intern(label) },
            10 + i as u32,
            100 + i as u32,
        );
    }
    builder.end_switch(&mut func, &mut adapter, 90, 500);

    // Start past the string-ness guard.
    let head = func.arena.head().expect("instructions");
    let start = func.arena.next(head).expect("instructions after the profiled switch");
    for (i, label) in labels.iter().enumerate() {
        let result =
            simulate(&func, &adapter, start, value_sym, SimValue::Str(intern(label)));
        assert_eq!(result, SimResult::Target(100 + i as u32), "label {}", label);
    }
    let miss = simulate(&func, &adapter, start, value_sym, SimValue::Str(intern("yellow")));
    assert_eq!(miss, SimResult::Target(500));
}

#[test]
fn test_optimized_int_switch_guards_with_bailout() {
    // Above the linear threshold the int fast path must be guarded: the
    // profiled instruction becomes a bailout, so a string arriving at an
    // int-optimized switch re-enters the interpreter.
    let cases: Vec<(i32, u32, u32)> =
        (0..8).map(|i| (i * 37, 10 + i as u32, 1000 + i as u32)).collect();
    let built = build_int_switch(&cases, 5000);

    let head = built.func.arena.head().expect("instructions");
    let result = simulate(
        &built.func,
        &built.adapter,
        head,
        built.value_sym,
        SimValue::Str(intern("oops")),
    );
    assert_eq!(result, SimResult::BailedOut(BailOutKind::ExpectingInteger));
}
