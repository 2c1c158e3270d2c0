//! Boolean circuits with constant folding, inversion propagation and AND-depth levels.
//!
//! A [`Circuit`] is a list of 2-input [`Gate`]s over numbered wires. Every wire carries a
//! [`WireFlag`] that tells how the value stored in memory relates to the logical value: wires can
//! be known constants or logically inverted without any gate being emitted. [`Circuit::add_gate`]
//! uses these flags to fold constants into the output wire and to absorb inverted inputs by
//! permuting the gate's truth table, so that only real work ends up in the gate list.
//!
//! Circuits go through three stages:
//!
//! 1. **Building**: input bundles come first, then output and temporary bundles in any order,
//!    then gates (temporaries may still be added at any time). Adding an input after any other
//!    wire, or an output after any gate, is an error.
//! 2. **Levelization** ([`Circuit::level_by_and_depth`]): the gate list is grouped into levels so
//!    that no gate reads the output of a non-linear gate of its own or a later level. Each level
//!    costs one round of communication when evaluated under secret sharing.
//! 3. **Evaluation**: the circuit is consumed by [`Circuit::evaluate`] or by the
//!    [`crate::evaluator`]. Structural edits after levelization are rejected.
//!
//! Circuits can be stored in a binary, a JSON and the "Bristol" text format (see [`codec`]).
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub mod codec;
mod level;

pub use codec::ContentHash;
pub use level::Levelize;

/// Index of a wire in a circuit.
pub type Wire = u32;

/// The 16 boolean functions of two inputs.
///
/// The discriminant is the truth table: bit `a | b << 1` of the code is the output for inputs
/// `a` and `b`. The six functions that ignore at least one input ([`GateType::Zero`],
/// [`GateType::One`], [`GateType::A`], [`GateType::B`], [`GateType::Na`], [`GateType::Nb`]) are
/// never stored as regular gates; [`GateType::A`] doubles as the code of copy gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GateType {
    /// Constant 0.
    Zero = 0,
    /// `!(a | b)`
    Nor = 1,
    /// `a & !b`
    NbAnd = 2,
    /// `!b`
    Nb = 3,
    /// `!a & b`
    NaAnd = 4,
    /// `!a`
    Na = 5,
    /// `a ^ b`
    Xor = 6,
    /// `!(a & b)`
    Nand = 7,
    /// `a & b`
    And = 8,
    /// `!(a ^ b)`
    Nxor = 9,
    /// `a`, also used for copy gates
    A = 10,
    /// `a | !b`
    NbOr = 11,
    /// `b`
    B = 12,
    /// `!a | b`
    NaOr = 13,
    /// `a | b`
    Or = 14,
    /// Constant 1.
    One = 15,
}

impl GateType {
    const ALL: [GateType; 16] = [
        GateType::Zero,
        GateType::Nor,
        GateType::NbAnd,
        GateType::Nb,
        GateType::NaAnd,
        GateType::Na,
        GateType::Xor,
        GateType::Nand,
        GateType::And,
        GateType::Nxor,
        GateType::A,
        GateType::NbOr,
        GateType::B,
        GateType::NaOr,
        GateType::Or,
        GateType::One,
    ];

    /// All 16 functions, ordered by code.
    pub fn all() -> impl Iterator<Item = GateType> {
        Self::ALL.into_iter()
    }

    /// The gate type with the given 4-bit truth table.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// The 4-bit truth table.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Applies the function.
    #[inline]
    pub fn eval(self, a: bool, b: bool) -> bool {
        (self.code() >> (a as u8 | (b as u8) << 1)) & 1 == 1
    }

    /// Whether the function ignores at least one of its inputs.
    pub fn is_degenerate(self) -> bool {
        matches!(
            self,
            GateType::Zero | GateType::One | GateType::A | GateType::B | GateType::Na | GateType::Nb
        )
    }

    /// Whether the function is affine over GF(2), i.e. free to evaluate on XOR shares.
    pub fn is_linear(self) -> bool {
        self.code().count_ones() % 2 == 0
    }

    /// The bits `[αa, αb, αc]` with `f(a, b) = ((a ^ αa) & (b ^ αb)) ^ αc` for non-linear `f`.
    pub fn alphas(self) -> Option<[bool; 3]> {
        if self.is_linear() {
            return None;
        }
        // an AND-like table has a single 1, an OR-like table a single 0
        let invert_out = self.code().count_ones() == 3;
        let idx = (0u8..4).find(|i| ((self.code() >> i) & 1 == 1) != invert_out)?;
        Some([idx & 1 == 0, idx & 2 == 0, invert_out])
    }

    fn permute(self, f: impl Fn(u8) -> u8) -> Self {
        let code = (0..4).fold(0, |acc, i| acc | ((self.code() >> f(i)) & 1) << i);
        Self::ALL[code as usize]
    }

    /// The function `(a, b) -> self(!a, b)`.
    pub fn invert_a(self) -> Self {
        self.permute(|i| i ^ 1)
    }

    /// The function `(a, b) -> self(a, !b)`.
    pub fn invert_b(self) -> Self {
        self.permute(|i| i ^ 2)
    }

    /// The function `(a, b) -> !self(a, b)`.
    pub fn invert_output(self) -> Self {
        Self::ALL[(!self.code() & 15) as usize]
    }
}

/// How the memory cell of a wire relates to its logical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WireFlag {
    /// The wire is constant 0, memory is not used.
    Zero = 0,
    /// The wire is constant 1, memory is not used.
    One = 1,
    /// The value is the memory cell.
    Wire = 2,
    /// The value is the negation of the memory cell.
    InvWire = 3,
    /// Nothing has been assigned yet.
    Uninitialized = 4,
}

impl WireFlag {
    /// The flag with the given byte encoding.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WireFlag::Zero),
            1 => Some(WireFlag::One),
            2 => Some(WireFlag::Wire),
            3 => Some(WireFlag::InvWire),
            4 => Some(WireFlag::Uninitialized),
            _ => None,
        }
    }

    /// The value of a constant wire.
    pub fn constant(self) -> Option<bool> {
        match self {
            WireFlag::Zero => Some(false),
            WireFlag::One => Some(true),
            _ => None,
        }
    }

    fn from_bool(value: bool) -> Self {
        if value { WireFlag::One } else { WireFlag::Zero }
    }

    fn inverted(self) -> Self {
        match self {
            WireFlag::Zero => WireFlag::One,
            WireFlag::One => WireFlag::Zero,
            WireFlag::Wire => WireFlag::InvWire,
            WireFlag::InvWire => WireFlag::Wire,
            WireFlag::Uninitialized => WireFlag::Uninitialized,
        }
    }
}

/// A stored gate.
///
/// For copy gates (`ty == GateType::A`) `in1` is not a wire but the length of the run: wires
/// `in0 + k` are copied to `out + k` for `k` in `0..in1`, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gate {
    /// First input.
    pub in0: Wire,
    /// Second input, or the run length of a copy.
    pub in1: Wire,
    /// The function, already adjusted for inverted inputs.
    pub ty: GateType,
    /// Output.
    pub out: Wire,
}

impl Gate {
    /// Whether this is a run of wire copies.
    pub fn is_copy(&self) -> bool {
        self.ty == GateType::A
    }

    /// Whether this gate needs communication under secret sharing.
    pub fn is_non_linear(&self) -> bool {
        !self.ty.is_linear()
    }
}

/// A debug annotation, emitted during clear evaluation before gate `gate_idx` runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Print {
    /// Index of the gate the annotation precedes; the gate count means "after the last gate".
    pub gate_idx: u32,
    /// The wire whose value is appended to the text.
    pub wire: Option<Wire>,
    /// Whether the wire was logically inverted when the annotation was added.
    pub invert: bool,
    /// The text.
    pub text: String,
}

/// One level of a levelled circuit.
#[derive(Debug, Clone, Copy)]
pub struct Level<'a> {
    /// The gates of the level, in evaluation order.
    pub gates: &'a [Gate],
    /// Number of non-linear gates among them.
    pub and_count: u32,
}

/// Errors when building, transforming, evaluating or decoding circuits.
#[derive(Debug, Error)]
pub enum Error {
    /// The wire index exceeds the wire count.
    #[error("wire {wire} is out of range, the circuit has {wire_count} wires")]
    WireOutOfRange {
        /// The offending wire.
        wire: Wire,
        /// Number of wires in the circuit.
        wire_count: u32,
    },
    /// The wire is read before anything was assigned to it.
    #[error("wire {0} is read before it is initialized")]
    UninitializedWire(Wire),
    /// Both gate inputs are the same wire.
    #[error("gate inputs must be distinct, both are wire {0}")]
    SameInputs(Wire),
    /// The gate type ignores an input; such gates are expressed with constants, copies or inversions.
    #[error("{0:?} gates must be expressed with add_const, add_copy or add_invert")]
    DegenerateGate(GateType),
    /// Inputs must be declared before any other wire.
    #[error("input bundles must be added before any other wire or gate")]
    InputAfterBuild,
    /// Outputs must be declared before the first gate.
    #[error("output bundles must be added before any gate")]
    OutputAfterGates,
    /// Input wires are never written by gates.
    #[error("wire {0} is an input and cannot be overwritten")]
    InputOverwrite(Wire),
    /// Two bundles that should match in width do not.
    #[error("bundle widths differ: {0} vs {1}")]
    BundleWidth(usize, usize),
    /// The number of supplied input bundles is wrong.
    #[error("expected {expected} input bundles, got {actual}")]
    WrongInputCount {
        /// Declared input bundles.
        expected: usize,
        /// Supplied input bundles.
        actual: usize,
    },
    /// A supplied input bundle has the wrong number of bits.
    #[error("input bundle {bundle} has {expected} wires, got {actual} bits")]
    WrongInputWidth {
        /// Index of the bundle.
        bundle: usize,
        /// Declared width.
        expected: usize,
        /// Supplied bits.
        actual: usize,
    },
    /// A gate reads or overwrites a non-linear output of its own level.
    #[error("gate {gate} uses a wire that is not available in its level")]
    EvaluationOrder {
        /// Index of the offending gate.
        gate: usize,
    },
    /// Serialized data is malformed.
    #[error("malformed circuit: {0}")]
    Format(String),
    /// Serialized data has an unknown format version.
    #[error("unsupported circuit format version {0}")]
    Version(u64),
    /// Serialized data does not match its content hash.
    #[error("content hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch {
        /// Hash found in the data.
        stored: ContentHash,
        /// Hash of the decoded circuit.
        computed: ContentHash,
    },
    /// The operation is not possible for this circuit.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Reading or writing failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Binary encoding failed.
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    /// JSON encoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A boolean circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub(crate) name: String,
    pub(crate) wire_count: u32,
    pub(crate) gates: Vec<Gate>,
    pub(crate) flags: Vec<WireFlag>,
    pub(crate) inputs: Vec<Vec<Wire>>,
    pub(crate) outputs: Vec<Vec<Wire>>,
    pub(crate) prints: Vec<Print>,
    pub(crate) level_counts: Vec<u32>,
    pub(crate) level_and_counts: Vec<u32>,
    pub(crate) non_linear: u64,
}

impl Circuit {
    /// An empty circuit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wire_count: 0,
            gates: vec![],
            flags: vec![],
            inputs: vec![],
            outputs: vec![],
            prints: vec![],
            level_counts: vec![],
            level_and_counts: vec![],
            non_linear: 0,
        }
    }

    /// The circuit's name. It is not part of the content hash.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the circuit.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Number of wires.
    pub fn wire_count(&self) -> u32 {
        self.wire_count
    }

    /// The stored gates in evaluation order.
    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    /// The flag of every wire.
    pub fn flags(&self) -> &[WireFlag] {
        &self.flags
    }

    /// Input bundles. Input wires are numbered contiguously from 0.
    pub fn inputs(&self) -> &[Vec<Wire>] {
        &self.inputs
    }

    /// Output bundles.
    pub fn outputs(&self) -> &[Vec<Wire>] {
        &self.outputs
    }

    /// Debug annotations.
    pub fn prints(&self) -> &[Print] {
        &self.prints
    }

    /// Number of gates per level. Empty if the circuit is not levelled.
    pub fn level_counts(&self) -> &[u32] {
        &self.level_counts
    }

    /// Number of non-linear gates per level.
    pub fn level_and_counts(&self) -> &[u32] {
        &self.level_and_counts
    }

    /// Whether level metadata is present. A circuit without gates counts as levelled.
    pub fn is_levelled(&self) -> bool {
        !self.level_counts.is_empty() || self.gates.is_empty()
    }

    /// The levels in order.
    pub fn levels(&self) -> impl Iterator<Item = Level<'_>> {
        let mut rest = self.gates.as_slice();
        self.level_counts
            .iter()
            .zip(&self.level_and_counts)
            .map(move |(count, and_count)| {
                let (gates, tail) = rest.split_at(*count as usize);
                rest = tail;
                Level {
                    gates,
                    and_count: *and_count,
                }
            })
    }

    /// Checks that no gate reads or overwrites the output of a non-linear gate of its own level.
    ///
    /// Under secret sharing such an output is only complete once the round of its level is over,
    /// so a violation would silently corrupt shares. Unlevelled circuits always pass.
    pub fn check_level_order(&self) -> Result<()> {
        fn busy(pending: &[bool], w: Wire) -> bool {
            pending.get(w as usize).copied().unwrap_or(false)
        }
        let mut pending = vec![false; self.wire_count as usize];
        let mut gate = 0;
        for level in self.levels() {
            let mut fresh = vec![];
            for g in level.gates {
                let clash = if g.is_copy() {
                    (0..g.in1).any(|k| {
                        busy(&pending, g.in0.saturating_add(k))
                            || busy(&pending, g.out.saturating_add(k))
                    })
                } else {
                    [g.in0, g.in1, g.out].into_iter().any(|w| busy(&pending, w))
                };
                if clash {
                    return Err(Error::EvaluationOrder { gate });
                }
                if g.is_non_linear() {
                    if let Some(p) = pending.get_mut(g.out as usize) {
                        *p = true;
                        fresh.push(g.out as usize);
                    }
                }
                gate += 1;
            }
            for w in fresh {
                pending[w] = false;
            }
        }
        Ok(())
    }

    /// Number of stored gates (a copy run counts once).
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Number of non-linear gates, the cost of the circuit under secret sharing.
    pub fn non_linear_gate_count(&self) -> u64 {
        self.non_linear
    }

    /// Number of levels, 0 if the circuit is not levelled.
    pub fn level_count(&self) -> usize {
        self.level_counts.len()
    }

    /// Number of input wires.
    pub fn input_wire_count(&self) -> u32 {
        self.inputs.iter().map(|b| b.len() as u32).sum()
    }

    fn alloc(&mut self, width: usize, flag: WireFlag) -> Vec<Wire> {
        let start = self.wire_count;
        self.wire_count += width as u32;
        self.flags.resize(self.wire_count as usize, flag);
        (start..self.wire_count).collect()
    }

    /// Adds an input bundle of `width` wires.
    pub fn add_input_bundle(&mut self, width: usize) -> Result<Vec<Wire>> {
        if self.input_wire_count() != self.wire_count || !self.gates.is_empty() {
            return Err(Error::InputAfterBuild);
        }
        let wires = self.alloc(width, WireFlag::Wire);
        self.inputs.push(wires.clone());
        Ok(wires)
    }

    /// Adds an output bundle of `width` uninitialized wires.
    pub fn add_output_bundle(&mut self, width: usize) -> Result<Vec<Wire>> {
        if !self.gates.is_empty() {
            return Err(Error::OutputAfterGates);
        }
        let wires = self.alloc(width, WireFlag::Uninitialized);
        self.outputs.push(wires.clone());
        Ok(wires)
    }

    /// Adds `width` uninitialized temporary wires.
    pub fn add_temp_bundle(&mut self, width: usize) -> Vec<Wire> {
        self.alloc(width, WireFlag::Uninitialized)
    }

    /// Adds temporary wires holding the given constants.
    pub fn add_const_bundle(&mut self, bits: &[bool]) -> Vec<Wire> {
        let wires = self.alloc(bits.len(), WireFlag::Zero);
        for (w, bit) in wires.iter().zip(bits) {
            self.flags[*w as usize] = WireFlag::from_bool(*bit);
        }
        wires
    }

    fn flag(&self, wire: Wire) -> Result<WireFlag> {
        self.flags
            .get(wire as usize)
            .copied()
            .ok_or(Error::WireOutOfRange {
                wire,
                wire_count: self.wire_count,
            })
    }

    fn readable(&self, wire: Wire) -> Result<WireFlag> {
        match self.flag(wire)? {
            WireFlag::Uninitialized => Err(Error::UninitializedWire(wire)),
            flag => Ok(flag),
        }
    }

    fn writable(&self, wire: Wire) -> Result<()> {
        self.flag(wire)?;
        if !self.level_counts.is_empty() {
            return Err(Error::Unsupported(
                "gates cannot be added to a levelled circuit".into(),
            ));
        }
        if wire < self.input_wire_count() {
            return Err(Error::InputOverwrite(wire));
        }
        Ok(())
    }

    /// Adds `out = ty(in0, in1)`.
    ///
    /// Constant inputs are folded into the output wire and inverted inputs are absorbed into the
    /// gate type, so the call may store no gate at all.
    pub fn add_gate(&mut self, in0: Wire, in1: Wire, ty: GateType, out: Wire) -> Result<()> {
        if ty.is_degenerate() {
            return Err(Error::DegenerateGate(ty));
        }
        let f0 = self.readable(in0)?;
        let f1 = self.readable(in1)?;
        self.writable(out)?;
        if in0 == in1 {
            return Err(Error::SameInputs(in0));
        }
        match (f0.constant(), f1.constant()) {
            (Some(a), Some(b)) => return self.add_const(out, ty.eval(a, b)),
            (Some(a), None) => return self.fold_unary(in1, out, ty.eval(a, false), ty.eval(a, true)),
            (None, Some(b)) => return self.fold_unary(in0, out, ty.eval(false, b), ty.eval(true, b)),
            (None, None) => {}
        }
        let mut ty = ty;
        if f0 == WireFlag::InvWire {
            ty = ty.invert_a();
        }
        if f1 == WireFlag::InvWire {
            ty = ty.invert_b();
        }
        if !ty.is_linear() {
            self.non_linear += 1;
        }
        self.gates.push(Gate { in0, in1, ty, out });
        self.flags[out as usize] = WireFlag::Wire;
        Ok(())
    }

    // `out = f(src)` where f(0) = at0 and f(1) = at1
    fn fold_unary(&mut self, src: Wire, out: Wire, at0: bool, at1: bool) -> Result<()> {
        if at0 == at1 {
            return self.add_const(out, at0);
        }
        self.add_copy(src, out)?;
        if at0 {
            self.add_invert(out)?;
        }
        Ok(())
    }

    /// Assigns a constant to `out`.
    pub fn add_const(&mut self, out: Wire, value: bool) -> Result<()> {
        self.writable(out)?;
        self.flags[out as usize] = WireFlag::from_bool(value);
        Ok(())
    }

    /// Adds `dest = src`. Copies of consecutive wires are merged into a single copy gate.
    pub fn add_copy(&mut self, src: Wire, dest: Wire) -> Result<()> {
        let flag = self.readable(src)?;
        self.writable(dest)?;
        if src == dest {
            return Ok(());
        }
        self.flags[dest as usize] = flag;
        if flag.constant().is_some() {
            return Ok(());
        }
        // a print between the two copies must see the state before the second one
        let annotated = self
            .prints
            .last()
            .is_some_and(|p| p.gate_idx as usize == self.gates.len());
        if let Some(last) = self.gates.last_mut().filter(|_| !annotated) {
            let len = last.in1;
            if last.is_copy()
                && last.in0 + len == src
                && last.out + len == dest
                && disjoint(last.in0, last.out, len + 1)
            {
                last.in1 += 1;
                return Ok(());
            }
        }
        self.gates.push(Gate {
            in0: src,
            in1: 1,
            ty: GateType::A,
            out: dest,
        });
        Ok(())
    }

    /// Copies `src[i]` to `dest[i]` for every `i`, in order.
    pub fn add_copy_bundle(&mut self, src: &[Wire], dest: &[Wire]) -> Result<()> {
        if src.len() != dest.len() {
            return Err(Error::BundleWidth(src.len(), dest.len()));
        }
        for (s, d) in src.iter().zip(dest) {
            self.add_copy(*s, *d)?;
        }
        Ok(())
    }

    /// Inverts `wire` in place. No gate is stored.
    pub fn add_invert(&mut self, wire: Wire) -> Result<()> {
        let flag = self.readable(wire)?;
        if !self.level_counts.is_empty() {
            return Err(Error::Unsupported(
                "wires of a levelled circuit cannot be inverted".into(),
            ));
        }
        self.flags[wire as usize] = flag.inverted();
        Ok(())
    }

    /// Adds `dest = !src`.
    pub fn add_invert_into(&mut self, src: Wire, dest: Wire) -> Result<()> {
        self.add_copy(src, dest)?;
        self.add_invert(dest)
    }

    /// Adds a text annotation at the current position.
    pub fn add_print(&mut self, text: impl Into<String>) {
        self.prints.push(Print {
            gate_idx: self.gates.len() as u32,
            wire: None,
            invert: false,
            text: text.into(),
        });
    }

    /// Adds an annotation that shows the current value of `wire` after the text.
    pub fn add_print_wire(&mut self, text: impl Into<String>, wire: Wire) -> Result<()> {
        let flag = self.readable(wire)?;
        let mut text = text.into();
        let (wire, invert) = match flag.constant() {
            Some(value) => {
                text.push(if value { '1' } else { '0' });
                (None, false)
            }
            None => (Some(wire), flag == WireFlag::InvWire),
        };
        self.prints.push(Print {
            gate_idx: self.gates.len() as u32,
            wire,
            invert,
            text,
        });
        Ok(())
    }

    /// Evaluates the circuit on plaintext inputs, one `Vec<bool>` per input bundle.
    ///
    /// Annotations are logged at `info` level with target `threefold::print`.
    pub fn evaluate(&self, inputs: &[Vec<bool>]) -> Result<Vec<Vec<bool>>> {
        self.run(inputs, &mut |line| info!(target: "threefold::print", "{line}"))
    }

    /// Like [`Circuit::evaluate`], but also returns the annotation lines.
    pub fn evaluate_traced(&self, inputs: &[Vec<bool>]) -> Result<(Vec<Vec<bool>>, Vec<String>)> {
        let mut lines = vec![];
        let outputs = self.run(inputs, &mut |line| lines.push(line))?;
        Ok((outputs, lines))
    }

    pub(crate) fn check_inputs(&self, inputs: &[Vec<bool>]) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            return Err(Error::WrongInputCount {
                expected: self.inputs.len(),
                actual: inputs.len(),
            });
        }
        for (bundle, (wires, bits)) in self.inputs.iter().zip(inputs).enumerate() {
            if wires.len() != bits.len() {
                return Err(Error::WrongInputWidth {
                    bundle,
                    expected: wires.len(),
                    actual: bits.len(),
                });
            }
        }
        Ok(())
    }

    fn run(&self, inputs: &[Vec<bool>], print: &mut dyn FnMut(String)) -> Result<Vec<Vec<bool>>> {
        self.check_inputs(inputs)?;
        self.check_level_order()?;
        let mut mem = vec![false; self.wire_count as usize];
        for (wires, bits) in self.inputs.iter().zip(inputs) {
            for (w, bit) in wires.iter().zip(bits) {
                mem[*w as usize] = *bit;
            }
        }

        let mut prints = self.prints.iter().peekable();
        let emit = |p: &Print, mem: &[bool], print: &mut dyn FnMut(String)| match p.wire {
            Some(w) => print(format!("{}{}", p.text, (mem[w as usize] ^ p.invert) as u8)),
            None => print(p.text.clone()),
        };

        for (i, gate) in self.gates.iter().enumerate() {
            while let Some(p) = prints.next_if(|p| p.gate_idx as usize <= i) {
                emit(p, &mem, &mut *print);
            }
            if gate.is_copy() {
                for k in 0..gate.in1 as usize {
                    mem[gate.out as usize + k] = mem[gate.in0 as usize + k];
                }
                continue;
            }
            mem[gate.out as usize] = gate.ty.eval(mem[gate.in0 as usize], mem[gate.in1 as usize]);
        }
        for p in prints {
            emit(p, &mem, &mut *print);
        }

        self.outputs
            .iter()
            .map(|wires| {
                wires
                    .iter()
                    .map(|w| match self.flags[*w as usize] {
                        WireFlag::Zero => Ok(false),
                        WireFlag::One => Ok(true),
                        WireFlag::Wire => Ok(mem[*w as usize]),
                        WireFlag::InvWire => Ok(!mem[*w as usize]),
                        WireFlag::Uninitialized => Err(Error::UninitializedWire(*w)),
                    })
                    .collect()
            })
            .collect()
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} wires, {} gates ({} non-linear), {} levels",
            self.name,
            self.wire_count,
            self.gates.len(),
            self.non_linear,
            self.level_counts.len()
        )
    }
}

fn disjoint(a: Wire, b: Wire, len: u32) -> bool {
    a + len <= b || b + len <= a
}
