//! An execution core for 3-party secure computation based on replicated secret sharing.
//!
//! Boolean circuits are evaluated by three parties that each hold two of the three XOR shares of
//! every wire. Linear gates are free, non-linear gates cost one message to a ring neighbour, and
//! all non-linear gates at the same AND depth share a single round of communication.
//!
//! ## Main Components
//!
//! * [`circuit`]: Circuit builder with constant folding and inversion propagation, clear
//!   evaluation, levelization by AND depth and the binary, JSON and Bristol formats.
//! * [`evaluator`]: The [`evaluator::ReplicatedEvaluator`], which evaluates one party's share of
//!   a levelled circuit on a batch of parallel instances.
//! * [`scheduler`] and [`runtime`]: A single-threaded task graph of round tasks, continuations
//!   and barriers, driving the communication of one party.
//! * [`channel`]: Communication abstractions for exchanging data between parties.
//! * [`matrix`]: Bit matrices and their replicated sharings, the format of inputs and outputs.
//!
//! ## Basic Usage
//!
//! Each party
//!
//! 1. sets up a [`channel::Channel`] to the other two parties and wraps it in a
//!    [`runtime::Runtime`],
//! 2. agrees on zero-sharing seeds with [`evaluator::exchange_seeds`],
//! 3. binds the circuit and its input shares to a [`evaluator::ReplicatedEvaluator`],
//! 4. evaluates and reads its output shares, which are reconstructed by whoever receives all
//!    three views.
//!
//! For simulated environments (testing/development), [`evaluator::simulate_replicated`] runs all
//! three parties in-process.
//!
//! ## Example
//!
//! ```
//! use threefold::{
//!     circuit::{Circuit, GateType},
//!     evaluator::simulate_replicated,
//!     matrix::BitMatrix,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut circuit = Circuit::new("and");
//! let x = circuit.add_input_bundle(1)?;
//! let y = circuit.add_input_bundle(1)?;
//! let z = circuit.add_output_bundle(1)?;
//! circuit.add_gate(x[0], y[0], GateType::And, z[0])?;
//!
//! // one row per instance
//! let x = BitMatrix::from_bits(&[vec![false], vec![true], vec![true]], 1)?;
//! let y = BitMatrix::from_bits(&[vec![true], vec![false], vec![true]], 1)?;
//! let out = simulate_replicated(&circuit, 3, &[x, y], None)?;
//! assert_eq!(out[0].row_bits(2), vec![true]);
//! assert_eq!(out[0].row_bits(0), vec![false]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The protocol is secure against a single semi-honest party: the two shares a party holds are
//! uniformly random and independent of the secret, and every message is masked with a fresh
//! sharing of zero. It does not protect against a party that deviates from the protocol.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod aes_rng;
pub mod channel;
pub mod circuit;
pub mod evaluator;
pub mod matrix;
pub mod runtime;
pub mod scheduler;

mod transpose;
mod utils;
