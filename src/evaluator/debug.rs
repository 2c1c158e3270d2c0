//! Plaintext cross-check of a replicated evaluation.
//!
//! All three parties of an in-process run share one [`DebugOracle`]. Each party deposits its own
//! share of the circuit inputs and of every gate output. Once the inputs of all parties are known
//! the oracle evaluates the circuit in the clear; once all three shares of a gate output are known
//! it reconstructs the value and compares it with the plaintext result.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::debug;

use super::Error;
use crate::circuit::{Circuit, GateType};

type Key = (usize, u32);

/// Shared board the parties of one evaluation report to.
#[derive(Debug, Clone, Default)]
pub struct DebugOracle(Arc<Mutex<Board>>);

#[derive(Debug, Default)]
struct Board {
    circuit: Option<Arc<Circuit>>,
    width: usize,
    words: usize,
    inputs: [Option<Vec<u64>>; 3],
    expected: Option<HashMap<Key, Vec<u64>>>,
    deposits: HashMap<Key, (u8, Vec<u64>)>,
    reconstructed: Vec<(Key, Vec<u64>)>,
    checked: usize,
}

impl DebugOracle {
    /// An empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of gate outputs that have been reconstructed and verified.
    pub fn checked(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).checked
    }

    pub(crate) fn register(
        &self,
        party: usize,
        circuit: &Arc<Circuit>,
        width: usize,
        input_share: Vec<u64>,
    ) -> Result<(), Error> {
        let mut board = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if board.circuit.is_none() {
            board.circuit = Some(Arc::clone(circuit));
            board.width = width;
            board.words = width.div_ceil(64);
        }
        board.inputs[party] = Some(input_share);
        if board.inputs.iter().all(Option::is_some) {
            let mut input = vec![0; board.inputs[0].as_ref().map_or(0, Vec::len)];
            for share in board.inputs.iter().flatten() {
                crate::utils::xor_inplace(&mut input, share);
            }
            let expected = match &board.circuit {
                Some(c) => plaintext(c, board.words, &input),
                None => HashMap::new(),
            };
            debug!(values = expected.len(), "debug oracle evaluated the circuit");
            board.expected = Some(expected);
            for (key, value) in std::mem::take(&mut board.reconstructed) {
                board.check(key, &value)?;
            }
        }
        Ok(())
    }

    pub(crate) fn deposit(&self, gate: usize, offset: u32, share: &[u64]) -> Result<(), Error> {
        let mut board = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let words = board.words;
        let key = (gate, offset);
        let (count, acc) = board
            .deposits
            .entry(key)
            .or_insert_with(|| (0, vec![0; words]));
        crate::utils::xor_inplace(acc, share);
        *count += 1;
        if *count < 3 {
            return Ok(());
        }
        let value = board
            .deposits
            .remove(&key)
            .map(|(_, acc)| acc)
            .unwrap_or_default();
        if board.expected.is_some() {
            board.check(key, &value)
        } else {
            board.reconstructed.push((key, value));
            Ok(())
        }
    }
}

impl Board {
    fn check(&mut self, (gate, offset): Key, value: &[u64]) -> Result<(), Error> {
        let expected = self
            .expected
            .as_ref()
            .and_then(|e| e.get(&(gate, offset)))
            .ok_or(Error::DebugMismatch { gate, offset })?;
        let (got, want): (&[u8], &[u8]) =
            (bytemuck::cast_slice(value), bytemuck::cast_slice(expected));
        let full = self.width / 8;
        let rest = self.width % 8;
        let mask = (1u8 << rest).wrapping_sub(1);
        if got[..full] != want[..full] || (rest > 0 && (got[full] ^ want[full]) & mask != 0) {
            return Err(Error::DebugMismatch { gate, offset });
        }
        self.checked += 1;
        Ok(())
    }
}

// The bit-sliced value of every gate output, keyed by gate index and copy offset.
fn plaintext(circuit: &Circuit, words: usize, input: &[u64]) -> HashMap<Key, Vec<u64>> {
    let mut mem = vec![0u64; circuit.wire_count() as usize * words];
    mem[..input.len()].copy_from_slice(input);
    let row = |w: u32| w as usize * words..(w as usize + 1) * words;
    let mut values = HashMap::new();
    for (i, g) in circuit.gates().iter().enumerate() {
        if g.is_copy() {
            for k in 0..g.in1 {
                mem.copy_within(row(g.in0 + k), row(g.out + k).start);
                values.insert((i, k), mem[row(g.out + k)].to_vec());
            }
            continue;
        }
        for j in 0..words {
            let (a, b) = (mem[row(g.in0).start + j], mem[row(g.in1).start + j]);
            mem[row(g.out).start + j] = eval_words(g.ty, a, b);
        }
        values.insert((i, 0), mem[row(g.out)].to_vec());
    }
    values
}

fn eval_words(ty: GateType, a: u64, b: u64) -> u64 {
    let code = ty.code();
    let terms = [!a & !b, a & !b, !a & b, a & b];
    (0..4)
        .filter(|i| code >> i & 1 == 1)
        .fold(0, |acc, i| acc | terms[i])
}
