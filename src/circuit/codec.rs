//! Storing circuits.
//!
//! Three formats are supported:
//!
//! - a binary format ([`Circuit::write_bin`] / [`Circuit::read_bin`]), encoded with `bincode`
//!   using fixed-width little endian integers and `u64` length prefixes,
//! - JSON ([`Circuit::to_json`] / [`Circuit::from_json`]) with the same logical fields,
//! - the "Bristol" text format for two-party circuits over AND, XOR and INV gates
//!   ([`Circuit::write_bristol`] / [`Circuit::read_bristol`]).
//!
//! The binary and JSON formats carry a [`ContentHash`] over all structural fields that is checked
//! on read. The Bristol format has no room for it: levels and prints are lost, and written
//! circuits are in single assignment form. Only unlevelled circuits without prints that use AND
//! and XOR gates, write every wire once and lay out their inputs, then one output bundle, then
//! temporaries come back with the same hash. Every other circuit comes back with the same clear
//! evaluation result.
use std::{
    fmt,
    io::{BufRead, Read, Write},
};

use serde::{Deserialize, Serialize};

use super::{Circuit, Error, Gate, GateType, Print, Result, Wire, WireFlag};

const TAG: [u8; 11] = *b"BetaCircuit";
const VERSION: u64 = 1;

/// A 128-bit hash over the structure of a circuit, excluding its name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    /// Parses 32 hex digits.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let mut bytes = [0; 16];
        hex::decode_to_slice(hex, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

// in0, in1, type, 3 bytes padding, out
fn pack(g: &Gate) -> [u8; 16] {
    let mut bytes = [0; 16];
    bytes[..4].copy_from_slice(&g.in0.to_le_bytes());
    bytes[4..8].copy_from_slice(&g.in1.to_le_bytes());
    bytes[8] = g.ty.code();
    bytes[12..].copy_from_slice(&g.out.to_le_bytes());
    bytes
}

#[derive(Serialize, Deserialize)]
struct PackedGate {
    in0: u32,
    in1: u32,
    ty: u8,
    pad: [u8; 3],
    out: u32,
}

#[derive(Serialize, Deserialize)]
struct BinCircuit {
    name: String,
    tag: [u8; 11],
    version: u64,
    inputs: Vec<Vec<Wire>>,
    outputs: Vec<Vec<Wire>>,
    wire_count: u32,
    gates: Vec<PackedGate>,
    flags: Vec<u8>,
    level_counts: Vec<u32>,
    level_and_counts: Vec<u32>,
    prints: Vec<Print>,
    hash: [u8; 16],
}

#[derive(Serialize, Deserialize)]
struct JsonCircuit {
    name: String,
    version: u64,
    inputs: Vec<Vec<Wire>>,
    outputs: Vec<Vec<Wire>>,
    wire_count: u32,
    gates: Vec<Gate>,
    flags: Vec<WireFlag>,
    level_counts: Vec<u32>,
    level_and_counts: Vec<u32>,
    prints: Vec<Print>,
    hash: String,
}

// A Bristol wire; output positions are only known once all gates are lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Wire(u32),
    Output(u32),
}

enum Op {
    Inv(Slot, Slot),
    Binary(&'static str, Slot, Slot, Slot),
}

struct Lowering {
    ops: Vec<Op>,
    next: u32,
}

impl Lowering {
    fn fresh(&mut self) -> Slot {
        self.next += 1;
        Slot::Wire(self.next - 1)
    }

    fn gate(&mut self, op: &'static str, a: Slot, b: Slot, z: Slot) {
        self.ops.push(Op::Binary(op, a, b, z));
    }

    fn inv(&mut self, a: Slot, z: Slot) {
        self.ops.push(Op::Inv(a, z));
    }

    fn inverted(&mut self, a: Slot) -> Slot {
        let t = self.fresh();
        self.inv(a, t);
        t
    }
}

fn format_err(msg: impl Into<String>) -> Error {
    Error::Format(msg.into())
}

impl Circuit {
    /// Hashes wire count, gates, prints, flags, levels, inputs and outputs.
    pub fn content_hash(&self) -> ContentHash {
        fn len(h: &mut blake3::Hasher, n: usize) {
            h.update(&(n as u64).to_le_bytes());
        }
        fn wires(h: &mut blake3::Hasher, ws: &[u32]) {
            len(h, ws.len());
            ws.iter().for_each(|w| {
                h.update(&w.to_le_bytes());
            });
        }

        let mut h = blake3::Hasher::new();
        h.update(&self.wire_count.to_le_bytes());
        len(&mut h, self.gates.len());
        for g in &self.gates {
            h.update(&pack(g));
        }
        len(&mut h, self.prints.len());
        for p in &self.prints {
            h.update(&p.gate_idx.to_le_bytes());
            match p.wire {
                Some(w) => h.update(&[1]).update(&w.to_le_bytes()),
                None => h.update(&[0]),
            };
            h.update(&[p.invert as u8]);
            len(&mut h, p.text.len());
            h.update(p.text.as_bytes());
        }
        len(&mut h, self.flags.len());
        for f in &self.flags {
            h.update(&[*f as u8]);
        }
        wires(&mut h, &self.level_counts);
        wires(&mut h, &self.level_and_counts);
        len(&mut h, self.inputs.len());
        for b in &self.inputs {
            wires(&mut h, b);
        }
        len(&mut h, self.outputs.len());
        for b in &self.outputs {
            wires(&mut h, b);
        }
        let mut hash = [0; 16];
        hash.copy_from_slice(&h.finalize().as_bytes()[..16]);
        ContentHash(hash)
    }

    /// Writes the binary format.
    pub fn write_bin<W: Write>(&self, w: W) -> Result<()> {
        let bin = BinCircuit {
            name: self.name.clone(),
            tag: TAG,
            version: VERSION,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            wire_count: self.wire_count,
            gates: self
                .gates
                .iter()
                .map(|g| PackedGate {
                    in0: g.in0,
                    in1: g.in1,
                    ty: g.ty.code(),
                    pad: [0; 3],
                    out: g.out,
                })
                .collect(),
            flags: self.flags.iter().map(|f| *f as u8).collect(),
            level_counts: self.level_counts.clone(),
            level_and_counts: self.level_and_counts.clone(),
            prints: self.prints.clone(),
            hash: self.content_hash().0,
        };
        bincode::serialize_into(w, &bin)?;
        Ok(())
    }

    /// Reads the binary format and verifies its content hash.
    pub fn read_bin<R: Read>(r: R) -> Result<Self> {
        let bin: BinCircuit = bincode::deserialize_from(r)?;
        if bin.tag != TAG {
            return Err(format_err("missing BetaCircuit tag"));
        }
        if bin.version != VERSION {
            return Err(Error::Version(bin.version));
        }
        let gates = bin
            .gates
            .into_iter()
            .map(|g| {
                let ty = GateType::from_code(g.ty)
                    .ok_or_else(|| format_err(format!("invalid gate type {}", g.ty)))?;
                Ok(Gate {
                    in0: g.in0,
                    in1: g.in1,
                    ty,
                    out: g.out,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let flags = bin
            .flags
            .into_iter()
            .map(|f| WireFlag::from_code(f).ok_or_else(|| format_err(format!("invalid flag {f}"))))
            .collect::<Result<Vec<_>>>()?;
        let c = Circuit {
            name: bin.name,
            wire_count: bin.wire_count,
            gates,
            flags,
            inputs: bin.inputs,
            outputs: bin.outputs,
            prints: bin.prints,
            level_counts: bin.level_counts,
            level_and_counts: bin.level_and_counts,
            non_linear: 0,
        };
        c.verified(ContentHash(bin.hash))
    }

    /// The binary format as bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![];
        self.write_bin(&mut bytes)?;
        Ok(bytes)
    }

    /// See [`Circuit::read_bin`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_bin(bytes)
    }

    /// Writes the JSON format.
    pub fn to_json(&self) -> Result<String> {
        let json = JsonCircuit {
            name: self.name.clone(),
            version: VERSION,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            wire_count: self.wire_count,
            gates: self.gates.clone(),
            flags: self.flags.clone(),
            level_counts: self.level_counts.clone(),
            level_and_counts: self.level_and_counts.clone(),
            prints: self.prints.clone(),
            hash: self.content_hash().to_string(),
        };
        Ok(serde_json::to_string_pretty(&json)?)
    }

    /// Reads the JSON format and verifies its content hash.
    pub fn from_json(json: &str) -> Result<Self> {
        let json: JsonCircuit = serde_json::from_str(json)?;
        if json.version != VERSION {
            return Err(Error::Version(json.version));
        }
        let stored = ContentHash::from_hex(&json.hash)
            .ok_or_else(|| format_err(format!("invalid hash {}", json.hash)))?;
        let c = Circuit {
            name: json.name,
            wire_count: json.wire_count,
            gates: json.gates,
            flags: json.flags,
            inputs: json.inputs,
            outputs: json.outputs,
            prints: json.prints,
            level_counts: json.level_counts,
            level_and_counts: json.level_and_counts,
            non_linear: 0,
        };
        c.verified(stored)
    }

    // Checks everything the builder would have guaranteed, then the hash.
    fn verified(mut self, stored: ContentHash) -> Result<Self> {
        let wc = self.wire_count;
        let in_range = |w: Wire| {
            if w < wc {
                Ok(())
            } else {
                Err(Error::WireOutOfRange {
                    wire: w,
                    wire_count: wc,
                })
            }
        };
        if self.flags.len() != wc as usize {
            return Err(format_err(format!(
                "{} flags for {wc} wires",
                self.flags.len()
            )));
        }
        for (i, w) in self.inputs.iter().flatten().enumerate() {
            if *w != i as Wire {
                return Err(format_err("input wires must be numbered from 0"));
            }
        }
        self.outputs.iter().flatten().try_for_each(|w| in_range(*w))?;
        for g in &self.gates {
            if g.is_copy() {
                if g.in1 == 0 {
                    return Err(format_err("empty copy"));
                }
                in_range(g.in0.saturating_add(g.in1 - 1))?;
                in_range(g.out.saturating_add(g.in1 - 1))?;
                continue;
            }
            if g.ty.is_degenerate() {
                return Err(Error::DegenerateGate(g.ty));
            }
            if g.in0 == g.in1 {
                return Err(Error::SameInputs(g.in0));
            }
            [g.in0, g.in1, g.out].into_iter().try_for_each(in_range)?;
        }
        if self.level_counts.len() != self.level_and_counts.len() {
            return Err(format_err("level and AND counts differ in length"));
        }
        if !self.level_counts.is_empty() {
            let total: u64 = self.level_counts.iter().map(|n| *n as u64).sum();
            if total != self.gates.len() as u64 {
                return Err(format_err(format!(
                    "levels hold {total} gates, circuit has {}",
                    self.gates.len()
                )));
            }
            let levels_match = self.levels().all(|level| {
                level.gates.iter().filter(|g| g.is_non_linear()).count() == level.and_count as usize
            });
            if !levels_match {
                return Err(format_err("level AND counts do not match the gates"));
            }
            self.check_level_order()?;
        }
        for p in &self.prints {
            if p.gate_idx as usize > self.gates.len() {
                return Err(format_err(format!("print after gate {}", p.gate_idx)));
            }
            p.wire.map(in_range).transpose()?;
        }
        self.non_linear = self.gates.iter().filter(|g| g.is_non_linear()).count() as u64;

        let computed = self.content_hash();
        if computed != stored {
            return Err(Error::HashMismatch { stored, computed });
        }
        Ok(self)
    }

    /// Writes the Bristol format. The circuit must have exactly two input bundles; all output
    /// bundles are concatenated into one.
    ///
    /// Every Bristol wire is written exactly once. The final write of a temporary keeps the
    /// temporary's position, earlier writes and the inversions needed to lower a gate to AND, XOR
    /// and INV get fresh wires, and copies only rename. The outputs are the last wires.
    pub fn write_bristol<W: Write>(&self, mut w: W) -> Result<()> {
        let [in0, in1] = self.inputs.as_slice() else {
            return Err(Error::Unsupported(format!(
                "Bristol circuits have 2 inputs, this one has {}",
                self.inputs.len()
            )));
        };
        let n_in = self.input_wire_count();
        let wc = self.wire_count as usize;
        let outputs: Vec<Wire> = self.outputs.iter().flatten().copied().collect();

        let mut is_output = vec![false; wc];
        for &o in &outputs {
            is_output[o as usize] = true;
        }
        let mut home = vec![None; wc];
        let mut next = n_in;
        for (wire, h) in home.iter_mut().enumerate().skip(n_in as usize) {
            if !is_output[wire] {
                *h = Some(next);
                next += 1;
            }
        }
        let mut last_write = vec![None; wc];
        for (i, g) in self.gates.iter().enumerate() {
            let len = if g.is_copy() { g.in1 } else { 1 };
            for k in 0..len {
                last_write[(g.out + k) as usize] = Some(i);
            }
        }
        // outputs whose final value a gate writes straight into the output wire
        let mut direct = vec![None; wc];
        let mut seen = vec![false; wc];
        for (j, &o) in outputs.iter().enumerate() {
            let o = o as usize;
            let by_gate = last_write[o].is_some_and(|i: usize| !self.gates[i].is_copy());
            if !seen[o] && by_gate && self.flags[o] == WireFlag::Wire {
                direct[o] = Some(j as u32);
            }
            seen[o] = true;
        }

        let mut low = Lowering { ops: vec![], next };
        let mut cur: Vec<Option<Slot>> = (0..wc as u32)
            .map(|w| (w < n_in).then_some(Slot::Wire(w)))
            .collect();
        let read = |cur: &[Option<Slot>], w: Wire| {
            cur[w as usize].ok_or(Error::UninitializedWire(w))
        };
        for (i, g) in self.gates.iter().enumerate() {
            if g.is_copy() {
                let src = (g.in0..g.in0 + g.in1)
                    .map(|w| read(&cur, w))
                    .collect::<Result<Vec<_>>>()?;
                for (k, slot) in src.into_iter().enumerate() {
                    cur[g.out as usize + k] = Some(slot);
                }
                continue;
            }
            let (a, b) = (read(&cur, g.in0)?, read(&cur, g.in1)?);
            let o = g.out as usize;
            let dest = match (last_write[o] == Some(i), direct[o], home[o]) {
                (true, Some(j), _) => Slot::Output(j),
                (true, None, Some(h)) => Slot::Wire(h),
                _ => low.fresh(),
            };
            match g.ty {
                GateType::Xor => low.gate("XOR", a, b, dest),
                GateType::Nxor => {
                    let t = low.fresh();
                    low.gate("XOR", a, b, t);
                    low.inv(t, dest);
                }
                ty => {
                    let Some([alpha_a, alpha_b, alpha_c]) = ty.alphas() else {
                        return Err(Error::DegenerateGate(ty));
                    };
                    let a = if alpha_a { low.inverted(a) } else { a };
                    let b = if alpha_b { low.inverted(b) } else { b };
                    if alpha_c {
                        let t = low.fresh();
                        low.gate("AND", a, b, t);
                        low.inv(t, dest);
                    } else {
                        low.gate("AND", a, b, dest);
                    }
                }
            }
            cur[o] = Some(dest);
        }
        for (j, &o) in outputs.iter().enumerate() {
            let target = Slot::Output(j as u32);
            match self.flags[o as usize] {
                WireFlag::Uninitialized => return Err(Error::UninitializedWire(o)),
                flag @ (WireFlag::Zero | WireFlag::One) => {
                    if n_in == 0 {
                        return Err(Error::Unsupported(
                            "constant outputs need at least one input wire".into(),
                        ));
                    }
                    let zero = Slot::Wire(0);
                    if flag == WireFlag::One {
                        let t = low.fresh();
                        low.gate("XOR", zero, zero, t);
                        low.inv(t, target);
                    } else {
                        low.gate("XOR", zero, zero, target);
                    }
                }
                WireFlag::Wire if direct[o as usize] == Some(j as u32) => {}
                WireFlag::Wire => {
                    let t = low.inverted(read(&cur, o)?);
                    low.inv(t, target);
                }
                WireFlag::InvWire => low.inv(read(&cur, o)?, target),
            }
        }

        let out_base = low.next;
        let id = |slot: Slot| match slot {
            Slot::Wire(w) => w,
            Slot::Output(j) => out_base + j,
        };
        writeln!(w, "{} {}", low.ops.len(), out_base + outputs.len() as u32)?;
        writeln!(w, "{} {} {}", in0.len(), in1.len(), outputs.len())?;
        writeln!(w)?;
        for op in low.ops {
            match op {
                Op::Inv(a, z) => writeln!(w, "1 1 {} {} INV", id(a), id(z))?,
                Op::Binary(op, a, b, z) => writeln!(w, "2 1 {} {} {} {op}", id(a), id(b), id(z))?,
            }
        }
        Ok(())
    }

    /// Reads the Bristol format. Output wires are moved to directly follow the inputs.
    pub fn read_bristol<R: BufRead>(name: impl Into<String>, r: R) -> Result<Self> {
        let mut lines = r
            .lines()
            .enumerate()
            .filter(|(_, l)| l.as_ref().map_or(true, |l| !l.trim().is_empty()));
        let mut numbers = |expected: usize| -> Result<Vec<u32>> {
            let (i, line) = lines
                .next()
                .ok_or_else(|| format_err("unexpected end of file"))?;
            let line = line?;
            let nums = line
                .split_whitespace()
                .map(|t| t.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format_err(format!("line {}: {e}", i + 1)))?;
            if nums.len() != expected {
                return Err(format_err(format!(
                    "line {}: expected {expected} numbers",
                    i + 1
                )));
            }
            Ok(nums)
        };
        let header = numbers(2)?;
        let (gate_count, wires) = (header[0], header[1]);
        let sizes = numbers(3)?;
        let (n0, n1, n_out) = (sizes[0], sizes[1], sizes[2]);
        let n_in = n0 + n1;
        if wires < n_in + n_out {
            return Err(format_err(format!(
                "{wires} wires cannot hold {n_in} inputs and {n_out} outputs"
            )));
        }

        let mut c = Circuit::new(name);
        c.add_input_bundle(n0 as usize)?;
        c.add_input_bundle(n1 as usize)?;
        c.add_output_bundle(n_out as usize)?;
        c.add_temp_bundle((wires - n_in - n_out) as usize);
        let first_out = wires - n_out;
        let map = |x: u32, line: usize| {
            if x >= wires {
                Err(format_err(format!("line {line}: wire {x} out of range")))
            } else if x < n_in {
                Ok(x)
            } else if x >= first_out {
                Ok(n_in + x - first_out)
            } else {
                Ok(x + n_out)
            }
        };

        let mut read = 0;
        for (i, line) in lines {
            let line = line?;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let bad = || format_err(format!("line {}: malformed gate {line:?}", i + 1));
            let (op, args) = tokens.split_last().ok_or_else(bad)?;
            let args = args
                .iter()
                .map(|t| t.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| bad())?;
            let wire = |k: usize| map(args[k], i + 1);
            match (*op, args.as_slice()) {
                ("XOR", [2, 1, a, b, _]) => {
                    let (x, y, z) = (wire(2)?, wire(3)?, wire(4)?);
                    if a == b {
                        c.add_const(z, false)?;
                    } else {
                        c.add_gate(x, y, GateType::Xor, z)?;
                    }
                }
                ("AND", [2, 1, a, b, _]) => {
                    let (x, y, z) = (wire(2)?, wire(3)?, wire(4)?);
                    if a == b {
                        c.add_copy(x, z)?;
                    } else {
                        c.add_gate(x, y, GateType::And, z)?;
                    }
                }
                ("INV" | "NOT", [1, 1, _, _]) => {
                    let (x, z) = (wire(2)?, wire(3)?);
                    if x == z {
                        c.add_invert(x)?;
                    } else {
                        c.add_invert_into(x, z)?;
                    }
                }
                ("XOR" | "AND" | "INV" | "NOT", _) => return Err(bad()),
                (op, _) => {
                    return Err(Error::Unsupported(format!(
                        "line {}: gate {op} is not AND, XOR or INV",
                        i + 1
                    )));
                }
            }
            read += 1;
        }
        if read != gate_count {
            return Err(format_err(format!(
                "header announces {gate_count} gates, found {read}"
            )));
        }
        Ok(c)
    }
}
