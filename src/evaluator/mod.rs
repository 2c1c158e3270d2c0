//! Evaluation of levelled circuits under 3-party replicated secret sharing.
//!
//! Every bit `x` is split into three shares `x = x0 ^ x1 ^ x2` and party `i` holds the pair
//! `(x_i, x_{i-1})`. The evaluator stores both shares of every wire in two share planes (plane 0
//! holds the party's own share, plane 1 the share of the previous party) in bit-sliced form: each
//! wire is one row of `batch_width` bits, one bit per parallel instance.
//!
//! Linear gates (XOR and XNOR) and copies are evaluated locally. All non-linear gates of a level
//! are evaluated together: each party computes its share of the product, masks it with a fresh
//! share of zero drawn from two AES streams it shares with its neighbours, sends the result to the
//! next party and receives the missing share from the previous party. This takes one round per
//! level that contains non-linear gates.
//!
//! The evaluator does not drive the network itself. [`ReplicatedEvaluator::schedule`] registers
//! the evaluation as round tasks on a [`Runtime`], so it can run alongside other protocols
//! sharing the same channel.
use std::{cell::RefCell, rc::Rc, sync::Arc};

use futures::future::try_join_all;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{Level, debug, instrument};

use crate::{
    aes_rng::AesRng,
    channel::{self, Channel, SimpleChannel},
    circuit::{self, Circuit, GateType, Levelize, Wire, WireFlag},
    matrix::{self, BitMatrix, SharedMatrix, reconstruct, share_matrix},
    runtime::{self, BoxError, Comm, Runtime, Task},
    scheduler::TaskId,
    transpose::transpose,
};

mod debug;

pub use debug::DebugOracle;

/// Number of parties of the replicated sharing.
pub const PARTIES: usize = 3;

/// Errors occurring while evaluating a circuit under replicated sharing.
#[derive(Debug, Error)]
pub enum Error {
    /// Replicated sharing has exactly 3 parties.
    #[error("party {0} does not exist, the parties are 0, 1 and 2")]
    InvalidParty(usize),
    /// No circuit has been bound to the evaluator.
    #[error("no circuit is bound to the evaluator")]
    NotBound,
    /// The input bundle does not exist.
    #[error("input bundle {0} does not exist")]
    InputOutOfRange(usize),
    /// The output bundle does not exist.
    #[error("output bundle {0} does not exist")]
    OutputOutOfRange(usize),
    /// Share matrices must have one row per instance and one column per bundle wire.
    #[error("expected a {}x{} share matrix, got {}x{}", expected.0, expected.1, actual.0, actual.1)]
    SizeMismatch {
        /// Rows and columns the bundle requires.
        expected: (usize, usize),
        /// Rows and columns of the supplied matrix.
        actual: (usize, usize),
    },
    /// The wires of the input bundle are not consecutive.
    #[error("the wires of input bundle {0} are not contiguous")]
    NonContiguousInput(usize),
    /// The evaluation has already been scheduled or has finished.
    #[error("the circuit has already been evaluated")]
    EvaluationComplete,
    /// Outputs are read before the last level has been evaluated.
    #[error("outputs are not available before all levels are evaluated")]
    EvaluationIncomplete,
    /// The previous party sent a message of unexpected length.
    #[error("level {level}: expected {expected} bytes of shares, got {actual}")]
    WrongMessageLength {
        /// The level the message belongs to.
        level: usize,
        /// Expected length in bytes.
        expected: usize,
        /// Received length in bytes.
        actual: usize,
    },
    /// The debug oracle reconstructed a gate output that differs from plaintext evaluation.
    #[error("gate {gate} (copy offset {offset}) reconstructs to a wrong value")]
    DebugMismatch {
        /// Index of the gate in the levelled circuit.
        gate: usize,
        /// Offset within a copy run, 0 for other gates.
        offset: u32,
    },
    /// The parties' output shares do not form a consistent sharing.
    #[error("output shares of the parties are inconsistent")]
    InconsistentShares,
    /// The circuit is malformed or cannot be levelled.
    #[error(transparent)]
    Circuit(#[from] circuit::Error),
    /// Scheduling or running the evaluation failed.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),
    /// Sending or receiving failed.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// A share matrix could not be assembled.
    #[error(transparent)]
    Matrix(#[from] matrix::Error),
    /// The simulation could not start its async runtime.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Seeds of the two AES streams a party shares with its neighbours.
///
/// `next` is shared with the next party (which holds it as its `prev`) and vice versa, so that the
/// masks `F(next) ^ F(prev)` of all three parties XOR to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroShareSeeds {
    /// Seed shared with the next party.
    pub next: [u8; 16],
    /// Seed shared with the previous party.
    pub prev: [u8; 16],
}

/// Samples a seed, sends it to the next party and receives the seed of the previous party.
#[instrument(level = Level::DEBUG, skip(channel), err)]
pub async fn exchange_seeds(
    channel: &mut impl Channel,
    party: usize,
) -> Result<ZeroShareSeeds, Error> {
    if party >= PARTIES {
        return Err(Error::InvalidParty(party));
    }
    let next: [u8; 16] = rand::random();
    let phase = "seed exchange";
    channel::send_to(channel, (party + 1) % PARTIES, phase, next.to_vec()).await?;
    let msg = channel::recv_from(channel, (party + PARTIES - 1) % PARTIES, phase, 16).await?;
    let mut prev = [0; 16];
    prev.copy_from_slice(&msg);
    Ok(ZeroShareSeeds { next, prev })
}

/// One party's evaluator.
#[derive(Debug)]
pub struct ReplicatedEvaluator {
    party: usize,
    seeds: ZeroShareSeeds,
    oracle: Option<DebugOracle>,
    state: Option<Rc<RefCell<State>>>,
}

impl ReplicatedEvaluator {
    /// Creates the evaluator of `party`.
    pub fn new(party: usize, seeds: ZeroShareSeeds) -> Result<Self, Error> {
        if party >= PARTIES {
            return Err(Error::InvalidParty(party));
        }
        Ok(Self {
            party,
            seeds,
            oracle: None,
            state: None,
        })
    }

    /// Cross-checks every gate output against a plaintext evaluation.
    ///
    /// All three parties must use clones of the same oracle. Takes effect for circuits bound
    /// afterwards.
    pub fn enable_debug(&mut self, oracle: DebugOracle) {
        self.oracle = Some(oracle);
    }

    /// The party this evaluator runs for.
    pub fn party(&self) -> usize {
        self.party
    }

    /// Prepares the evaluation of `circuit` on `batch_width` parallel instances.
    ///
    /// Unlevelled circuits are levelled by AND depth first, on a private copy if the circuit is
    /// shared. Any previously bound circuit and its state are discarded; the zero-sharing streams
    /// continue where the previous evaluation left them, so all parties must bind the same
    /// sequence of circuits.
    pub fn bind_circuit(
        &mut self,
        mut circuit: Arc<Circuit>,
        batch_width: usize,
    ) -> Result<(), Error> {
        if !circuit.is_levelled() {
            Arc::make_mut(&mut circuit).level_by_and_depth(Levelize::default())?;
        }
        let words = batch_width.div_ceil(64);
        let rows = circuit.wire_count() as usize * words;
        let mut level_starts = Vec::with_capacity(circuit.level_count());
        let mut start = 0;
        for &count in circuit.level_counts() {
            level_starts.push(start);
            start += count as usize;
        }
        let (rng_next, rng_prev) = match self.state.take() {
            Some(old) => {
                let old = old.borrow();
                (old.rng_next.clone(), old.rng_prev.clone())
            }
            None => (
                AesRng::from_seed(self.seeds.next),
                AesRng::from_seed(self.seeds.prev),
            ),
        };
        debug!(
            party = self.party,
            circuit = %circuit.name(),
            batch_width,
            levels = level_starts.len(),
            "circuit bound"
        );
        self.state = Some(Rc::new(RefCell::new(State {
            party: self.party,
            circuit,
            width: batch_width,
            words,
            planes: [vec![0; rows], vec![0; rows]],
            rng_next,
            rng_prev,
            level_starts,
            level: 0,
            awaiting: false,
            scheduled: false,
            oracle: self.oracle.clone(),
        })));
        Ok(())
    }

    /// The circuit being evaluated, levelled.
    pub fn circuit(&self) -> Result<Arc<Circuit>, Error> {
        Ok(Arc::clone(&self.state()?.borrow().circuit))
    }

    /// The number of parallel instances.
    pub fn batch_width(&self) -> Result<usize, Error> {
        Ok(self.state()?.borrow().width)
    }

    /// Loads this party's view of input bundle `idx`.
    ///
    /// `share` has one row per instance and one column per wire of the bundle.
    pub fn set_input(&mut self, idx: usize, share: &SharedMatrix) -> Result<(), Error> {
        let mut st = self.state()?.borrow_mut();
        if st.scheduled {
            return Err(Error::EvaluationComplete);
        }
        let circuit = Arc::clone(&st.circuit);
        let wires = circuit.inputs().get(idx).ok_or(Error::InputOutOfRange(idx))?;
        let expected = (st.width, wires.len());
        let actual = (share.rows(), share.cols());
        if expected != actual {
            return Err(Error::SizeMismatch { expected, actual });
        }
        let first = wires.first().copied().unwrap_or_default();
        if wires.iter().zip(first..).any(|(&w, expected)| w != expected) {
            return Err(Error::NonContiguousInput(idx));
        }
        for p in 0..2 {
            let sliced = transpose(share.plane(p));
            for (k, &w) in wires.iter().enumerate() {
                let row = st.row_mut(p, w);
                row.fill(0);
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(row);
                bytes[..sliced.stride()].copy_from_slice(sliced.row(k));
            }
        }
        Ok(())
    }

    /// Registers the evaluation on `rt`, to start once all of `deps` have completed.
    ///
    /// Returns a task that completes once the last level has been evaluated.
    pub fn schedule<C: Channel>(
        &mut self,
        rt: &mut Runtime<C>,
        deps: &[TaskId],
    ) -> Result<TaskId, Error> {
        let state = Rc::clone(self.state()?);
        {
            let mut st = state.borrow_mut();
            if st.scheduled {
                return Err(Error::EvaluationComplete);
            }
            st.scheduled = true;
            st.register_debug()?;
        }
        let first = rt.add_round(deps, "level 0", move |comm, task| {
            level_round(state, comm, task)
        })?;
        Ok(rt.add_closure(first)?)
    }

    /// Schedules the evaluation and runs `rt` until it has finished.
    pub async fn evaluate<C: Channel>(&mut self, rt: &mut Runtime<C>) -> Result<(), Error> {
        let done = self.schedule(rt, &[])?;
        rt.run_until_task_completes(done).await?;
        Ok(())
    }

    /// Whether all levels have been evaluated.
    pub fn is_complete(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|st| st.borrow().is_complete())
    }

    /// Reads this party's view of output bundle `idx`, one row per instance.
    pub fn get_output(&self, idx: usize) -> Result<SharedMatrix, Error> {
        let st = self.state()?.borrow();
        let wires = st
            .circuit
            .outputs()
            .get(idx)
            .ok_or(Error::OutputOutOfRange(idx))?;
        if !st.is_complete() {
            return Err(Error::EvaluationIncomplete);
        }
        let mut planes = [
            BitMatrix::new(wires.len(), st.width),
            BitMatrix::new(wires.len(), st.width),
        ];
        for (p, plane) in planes.iter_mut().enumerate() {
            let holds_x0 = x0_plane(self.party) == Some(p);
            for (k, &w) in wires.iter().enumerate() {
                let stride = plane.stride();
                let dest = plane.row_mut(k);
                match st.circuit.flags()[w as usize] {
                    WireFlag::Zero => {}
                    WireFlag::One => {
                        if holds_x0 {
                            dest.fill(0xff);
                        }
                    }
                    flag @ (WireFlag::Wire | WireFlag::InvWire) => {
                        let bytes: &[u8] = bytemuck::cast_slice(st.row(p, w));
                        dest.copy_from_slice(&bytes[..stride]);
                        if flag == WireFlag::InvWire && holds_x0 {
                            dest.iter_mut().for_each(|b| *b ^= 0xff);
                        }
                    }
                    WireFlag::Uninitialized => {
                        return Err(circuit::Error::UninitializedWire(w).into());
                    }
                }
            }
            plane.clear_padding();
        }
        let [own, prev] = planes;
        Ok(SharedMatrix::from_planes(transpose(&own), transpose(&prev))?)
    }

    fn state(&self) -> Result<&Rc<RefCell<State>>, Error> {
        self.state.as_ref().ok_or(Error::NotBound)
    }
}

/// The plane that holds share `x0`, which absorbs public constants and inversions.
fn x0_plane(party: usize) -> Option<usize> {
    (party < 2).then_some(party)
}

#[derive(Debug)]
struct State {
    party: usize,
    circuit: Arc<Circuit>,
    width: usize,
    words: usize,
    planes: [Vec<u64>; 2],
    rng_next: AesRng,
    rng_prev: AesRng,
    level_starts: Vec<usize>,
    level: usize,
    awaiting: bool,
    scheduled: bool,
    oracle: Option<DebugOracle>,
}

impl State {
    fn row(&self, plane: usize, w: Wire) -> &[u64] {
        let start = w as usize * self.words;
        &self.planes[plane][start..start + self.words]
    }

    fn row_mut(&mut self, plane: usize, w: Wire) -> &mut [u64] {
        let start = w as usize * self.words;
        &mut self.planes[plane][start..start + self.words]
    }

    fn is_complete(&self) -> bool {
        self.level == self.level_starts.len() && !self.awaiting
    }

    fn register_debug(&self) -> Result<(), Error> {
        let Some(oracle) = &self.oracle else {
            return Ok(());
        };
        let n = self.circuit.input_wire_count() as usize * self.words;
        oracle.register(
            self.party,
            &self.circuit,
            self.width,
            self.planes[0][..n].to_vec(),
        )
    }

    fn deposit(&self, gate: usize, offset: u32, out: Wire) -> Result<(), Error> {
        match &self.oracle {
            Some(oracle) => oracle.deposit(gate, offset, self.row(0, out)),
            None => Ok(()),
        }
    }

    /// Evaluates the next level locally.
    ///
    /// Returns the masked shares of the level's non-linear gates and their output wires.
    fn eval_level(&mut self) -> Result<(Vec<u8>, Vec<Wire>), Error> {
        let circuit = Arc::clone(&self.circuit);
        let level = self.level;
        let start = self.level_starts[level];
        let gates = &circuit.gates()[start..start + circuit.level_counts()[level] as usize];
        let words = self.words;
        let bytes_per_gate = self.width.div_ceil(8);
        let x0 = x0_plane(self.party);
        let mut msg = Vec::with_capacity(circuit.level_and_counts()[level] as usize * bytes_per_gate);
        let mut and_outputs = vec![];
        let mut a = [vec![0u64; words], vec![0u64; words]];
        let mut b = [vec![0u64; words], vec![0u64; words]];
        let mut mask = vec![0u64; words];
        let mut z = vec![0u64; words];

        for (i, g) in gates.iter().enumerate() {
            let gate = start + i;
            if g.is_copy() {
                for k in 0..g.in1 {
                    for p in 0..2 {
                        let src = (g.in0 + k) as usize * words;
                        let dest = (g.out + k) as usize * words;
                        self.planes[p].copy_within(src..src + words, dest);
                    }
                    self.deposit(gate, k, g.out + k)?;
                }
                continue;
            }
            for p in 0..2 {
                a[p].copy_from_slice(self.row(p, g.in0));
                b[p].copy_from_slice(self.row(p, g.in1));
            }
            match g.ty {
                GateType::Xor | GateType::Nxor => {
                    for p in 0..2 {
                        let flip = if g.ty == GateType::Nxor && x0 == Some(p) {
                            !0
                        } else {
                            0
                        };
                        let out = self.row_mut(p, g.out);
                        for j in 0..words {
                            out[j] = a[p][j] ^ b[p][j] ^ flip;
                        }
                    }
                }
                ty => {
                    let [alpha_a, alpha_b, alpha_c] =
                        ty.alphas().ok_or(circuit::Error::DegenerateGate(ty))?;
                    if let Some(p) = x0 {
                        if alpha_a {
                            a[p].iter_mut().for_each(|w| *w = !*w);
                        }
                        if alpha_b {
                            b[p].iter_mut().for_each(|w| *w = !*w);
                        }
                    }
                    self.rng_next.fill_words(&mut mask);
                    self.rng_prev.fill_words(&mut z);
                    let flip = if alpha_c && self.party == 0 { !0 } else { 0 };
                    for j in 0..words {
                        z[j] ^= mask[j]
                            ^ (a[0][j] & b[0][j])
                            ^ (a[0][j] & b[1][j])
                            ^ (a[1][j] & b[0][j])
                            ^ flip;
                    }
                    self.row_mut(0, g.out).copy_from_slice(&z);
                    let bytes: &[u8] = bytemuck::cast_slice(&z);
                    msg.extend_from_slice(&bytes[..bytes_per_gate]);
                    and_outputs.push(g.out);
                }
            }
            self.deposit(gate, 0, g.out)?;
        }
        debug!(
            party = self.party,
            level,
            gates = gates.len(),
            and_gates = and_outputs.len(),
            bytes = msg.len(),
            "level evaluated"
        );
        self.level += 1;
        self.awaiting = !and_outputs.is_empty();
        Ok((msg, and_outputs))
    }

    /// Stores the shares received from the previous party for the non-linear gates of `level`.
    fn finish_level(&mut self, level: usize, outputs: &[Wire], msg: &[u8]) -> Result<(), Error> {
        let bytes_per_gate = self.width.div_ceil(8);
        if msg.len() != outputs.len() * bytes_per_gate {
            return Err(Error::WrongMessageLength {
                level,
                expected: outputs.len() * bytes_per_gate,
                actual: msg.len(),
            });
        }
        for (&w, share) in outputs.iter().zip(msg.chunks(bytes_per_gate.max(1))) {
            let row: &mut [u8] = bytemuck::cast_slice_mut(self.row_mut(1, w));
            row[..share.len()].copy_from_slice(share);
        }
        self.awaiting = false;
        Ok(())
    }
}

// Evaluates levels until one needs communication, then hands over to a continuation.
fn level_round(
    state: Rc<RefCell<State>>,
    comm: &mut Comm,
    task: &mut Task<'_>,
) -> Result<(), BoxError> {
    let (level, msg, outputs) = {
        let mut st = state.borrow_mut();
        loop {
            if st.is_complete() {
                return Ok(());
            }
            let level = st.level;
            let (msg, outputs) = st.eval_level()?;
            if !outputs.is_empty() {
                break (level, msg, outputs);
            }
        }
    };
    let len = msg.len();
    comm.send_next(msg);
    let mut pending = comm.recv_prev(len);
    task.then_continuation(&format!("level {level} shares"), move |task| {
        let msg = pending.get()?;
        let complete = {
            let mut st = state.borrow_mut();
            st.finish_level(level, &outputs, &msg)?;
            st.is_complete()
        };
        if !complete {
            task.then_round(&format!("level {}", level + 1), move |comm, task| {
                level_round(state, comm, task)
            })?;
        }
        Ok(())
    })?;
    Ok(())
}

/// Evaluates `circuit` on `batch_width` instances by running all three parties in-process.
///
/// Each input matrix has one row per instance. The inputs are secret-shared, evaluated by three
/// evaluators connected through [`SimpleChannel`]s and the outputs are reconstructed. With an
/// `oracle`, every gate output is checked against a plaintext evaluation.
#[instrument(level = Level::DEBUG, skip_all, fields(circuit = %circuit.name(), batch_width = batch_width), err)]
pub fn simulate_replicated(
    circuit: &Circuit,
    batch_width: usize,
    inputs: &[BitMatrix],
    oracle: Option<DebugOracle>,
) -> Result<Vec<BitMatrix>, Error> {
    if inputs.len() != circuit.inputs().len() {
        return Err(circuit::Error::WrongInputCount {
            expected: circuit.inputs().len(),
            actual: inputs.len(),
        }
        .into());
    }
    let mut circuit = circuit.clone();
    if !circuit.is_levelled() {
        circuit.level_by_and_depth(Levelize::default())?;
    }
    let circuit = Arc::new(circuit);

    let mut rng = rand::rng();
    let mut views: [Vec<SharedMatrix>; PARTIES] = Default::default();
    for input in inputs {
        for (view, share) in views.iter_mut().zip(share_matrix(input, &mut rng)) {
            view.push(share);
        }
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let parties = SimpleChannel::channels(PARTIES)
        .into_iter()
        .zip(views)
        .enumerate()
        .map(|(party, (channel, inputs))| {
            run_party(
                party,
                channel,
                Arc::clone(&circuit),
                batch_width,
                inputs,
                oracle.clone(),
            )
        });
    let mut views = rt.block_on(try_join_all(parties))?;

    let mut outputs = Vec::with_capacity(circuit.outputs().len());
    for _ in 0..circuit.outputs().len() {
        let shares = [
            views[0].remove(0),
            views[1].remove(0),
            views[2].remove(0),
        ];
        outputs.push(reconstruct(&shares).ok_or(Error::InconsistentShares)?);
    }
    Ok(outputs)
}

async fn run_party(
    party: usize,
    channel: SimpleChannel,
    circuit: Arc<Circuit>,
    batch_width: usize,
    inputs: Vec<SharedMatrix>,
    oracle: Option<DebugOracle>,
) -> Result<Vec<SharedMatrix>, Error> {
    let mut rt = Runtime::new(channel, party, PARTIES);
    let seeds = exchange_seeds(rt.channel_mut(), party).await?;
    let mut evaluator = ReplicatedEvaluator::new(party, seeds)?;
    if let Some(oracle) = oracle {
        evaluator.enable_debug(oracle);
    }
    evaluator.bind_circuit(Arc::clone(&circuit), batch_width)?;
    for (idx, share) in inputs.iter().enumerate() {
        evaluator.set_input(idx, share)?;
    }
    evaluator.evaluate(&mut rt).await?;
    (0..circuit.outputs().len())
        .map(|idx| evaluator.get_output(idx))
        .collect()
}
