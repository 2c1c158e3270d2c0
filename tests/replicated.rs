use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use threefold::{
    channel::SimpleChannel,
    circuit::{self, Circuit, GateType, Levelize},
    evaluator::{DebugOracle, Error, ReplicatedEvaluator, ZeroShareSeeds, simulate_replicated},
    matrix::{BitMatrix, SharedMatrix, reconstruct, share_matrix},
    runtime::Runtime,
};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

fn adder(bits: usize) -> Result<Circuit, circuit::Error> {
    let mut c = Circuit::new(format!("add{bits}"));
    let a = c.add_input_bundle(bits)?;
    let b = c.add_input_bundle(bits)?;
    let sum = c.add_output_bundle(bits)?;
    let mut carry = c.add_const_bundle(&[false])[0];
    for i in 0..bits {
        let t = c.add_temp_bundle(4);
        c.add_gate(a[i], b[i], GateType::Xor, t[0])?;
        c.add_gate(t[0], carry, GateType::Xor, sum[i])?;
        c.add_gate(a[i], b[i], GateType::And, t[1])?;
        c.add_gate(t[0], carry, GateType::And, t[2])?;
        c.add_gate(t[1], t[2], GateType::Xor, t[3])?;
        carry = t[3];
    }
    Ok(c)
}

fn clear_outputs(c: &Circuit, inputs: &[BitMatrix], rows: usize) -> Vec<Vec<Vec<bool>>> {
    (0..rows)
        .map(|r| {
            let row: Vec<Vec<bool>> = inputs.iter().map(|m| m.row_bits(r)).collect();
            c.evaluate(&row).unwrap()
        })
        .collect()
}

fn assert_matches_clear(c: &Circuit, inputs: &[BitMatrix], outputs: &[BitMatrix], rows: usize) {
    let expected = clear_outputs(c, inputs, rows);
    for (r, expected) in expected.iter().enumerate() {
        for (bundle, bits) in expected.iter().enumerate() {
            assert_eq!(&outputs[bundle].row_bits(r), bits, "instance {r}");
        }
    }
}

#[test]
fn and_gate_on_64_instances() -> Result<(), Error> {
    let mut c = Circuit::new("and");
    let x = c.add_input_bundle(1)?;
    let y = c.add_input_bundle(1)?;
    let z = c.add_output_bundle(1)?;
    c.add_gate(x[0], y[0], GateType::And, z[0])?;

    for (a, b) in [(false, false), (false, true), (true, false), (true, true)] {
        assert_eq!(c.evaluate(&[vec![a], vec![b]])?, vec![vec![a & b]]);
    }

    // each input combination repeated 16 times
    let xs: Vec<Vec<bool>> = (0..64).map(|r| vec![(r / 16) & 2 != 0]).collect();
    let ys: Vec<Vec<bool>> = (0..64).map(|r| vec![(r / 16) & 1 != 0]).collect();
    let x = BitMatrix::from_bits(&xs, 1)?;
    let y = BitMatrix::from_bits(&ys, 1)?;
    let out = simulate_replicated(&c, 64, &[x, y], None)?;
    assert_eq!(out.len(), 1);
    for r in 0..64 {
        assert_eq!(out[0].get(r, 0), xs[r][0] & ys[r][0], "instance {r}");
    }
    Ok(())
}

#[test]
fn every_gate_family_reconstructs_correctly() -> Result<(), Error> {
    let xs = BitMatrix::from_bits(&[vec![false], vec![true], vec![false], vec![true]], 1)?;
    let ys = BitMatrix::from_bits(&[vec![false], vec![false], vec![true], vec![true]], 1)?;
    for ty in GateType::all().filter(|ty| !ty.is_degenerate()) {
        let mut c = Circuit::new(format!("{ty:?}"));
        let x = c.add_input_bundle(1)?;
        let y = c.add_input_bundle(1)?;
        let z = c.add_output_bundle(1)?;
        c.add_gate(x[0], y[0], ty, z[0])?;
        let oracle = DebugOracle::new();
        let out = simulate_replicated(&c, 4, &[xs.clone(), ys.clone()], Some(oracle.clone()))?;
        for r in 0..4 {
            assert_eq!(out[0].get(r, 0), ty.eval(xs.get(r, 0), ys.get(r, 0)), "{ty:?}");
        }
        assert_eq!(oracle.checked(), 1);
    }
    Ok(())
}

#[test]
fn adder_under_debug_oracle() -> Result<(), Error> {
    let _g = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default();

    let c = adder(8)?;
    let mut rng = ChaCha20Rng::seed_from_u64(42);
    let inputs = [
        BitMatrix::random(100, 8, &mut rng),
        BitMatrix::random(100, 8, &mut rng),
    ];
    let oracle = DebugOracle::new();
    let out = simulate_replicated(&c, 100, &inputs, Some(oracle.clone()))?;
    assert_matches_clear(&c, &inputs, &out, 100);
    assert!(oracle.checked() > 0);
    Ok(())
}

#[test]
fn levelization_modes_agree() -> Result<(), Error> {
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let inputs = [
        BitMatrix::random(70, 6, &mut rng),
        BitMatrix::random(70, 6, &mut rng),
    ];
    for mode in [Levelize::Reorder, Levelize::NoReorder, Levelize::SingleGate] {
        let mut c = adder(6)?;
        c.level_by_and_depth(mode)?;
        let out = simulate_replicated(&c, 70, &inputs, None)?;
        assert_matches_clear(&adder(6)?, &inputs, &out, 70);
    }
    Ok(())
}

#[test]
fn wrong_input_count_is_rejected() -> Result<(), circuit::Error> {
    let c = adder(2)?;
    let only_one = [BitMatrix::new(8, 2)];
    assert!(matches!(
        simulate_replicated(&c, 8, &only_one, None),
        Err(Error::Circuit(circuit::Error::WrongInputCount {
            expected: 2,
            actual: 1
        }))
    ));
    assert!(matches!(
        simulate_replicated(&c, 8, &[BitMatrix::new(8, 2), BitMatrix::new(9, 2)], None),
        Err(Error::SizeMismatch { .. })
    ));
    Ok(())
}

fn ring_seeds() -> [ZeroShareSeeds; 3] {
    let s = [[7u8; 16], [8; 16], [9; 16]];
    [0, 1, 2].map(|i| ZeroShareSeeds {
        next: s[i],
        prev: s[(i + 2) % 3],
    })
}

async fn run_parties(
    circuits: &[Arc<Circuit>],
    width: usize,
    inputs: &[Vec<[SharedMatrix; 3]>],
    seeds: [ZeroShareSeeds; 3],
    oracle: Option<DebugOracle>,
) -> Result<Vec<Vec<Vec<SharedMatrix>>>, Error> {
    let mut parties = vec![];
    for (party, channel) in SimpleChannel::channels(3).into_iter().enumerate() {
        let mut evaluators = vec![];
        for (c, inputs) in circuits.iter().zip(inputs) {
            let mut ev = ReplicatedEvaluator::new(party, seeds[party])?;
            if let Some(oracle) = &oracle {
                ev.enable_debug(oracle.clone());
            }
            ev.bind_circuit(Arc::clone(c), width)?;
            for (idx, shares) in inputs.iter().enumerate() {
                ev.set_input(idx, &shares[party])?;
            }
            evaluators.push(ev);
        }
        parties.push(async move {
            let mut rt = Runtime::new(channel, party, 3);
            let mut done = vec![];
            for ev in evaluators.iter_mut() {
                done.push(ev.schedule(&mut rt, &[])?);
            }
            let all = rt.add_and(&done, "all evaluations")?;
            rt.run_until_task_completes(all).await?;
            evaluators
                .iter()
                .map(|ev| {
                    let outputs = ev.circuit()?.outputs().len();
                    (0..outputs).map(|i| ev.get_output(i)).collect()
                })
                .collect::<Result<Vec<Vec<SharedMatrix>>, Error>>()
        });
    }
    futures::future::try_join_all(parties).await
}

#[tokio::test]
async fn independent_evaluations_share_one_runtime() -> Result<(), Error> {
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let circuits = [Arc::new(adder(4)?), Arc::new(adder(7)?)];
    let plain = [
        [BitMatrix::random(16, 4, &mut rng), BitMatrix::random(16, 4, &mut rng)],
        [BitMatrix::random(16, 7, &mut rng), BitMatrix::random(16, 7, &mut rng)],
    ];
    let shared: Vec<Vec<[SharedMatrix; 3]>> = plain
        .iter()
        .map(|inputs| inputs.iter().map(|m| share_matrix(m, &mut rng)).collect())
        .collect();

    let views = run_parties(&circuits, 16, &shared, ring_seeds(), None).await?;
    for (i, c) in circuits.iter().enumerate() {
        let out = [
            views[0][i][0].clone(),
            views[1][i][0].clone(),
            views[2][i][0].clone(),
        ];
        let out = reconstruct(&out).ok_or(Error::InconsistentShares)?;
        assert_matches_clear(c, &plain[i], &[out], 16);
    }
    Ok(())
}

#[tokio::test]
async fn oracle_detects_mismatched_seeds() -> Result<(), Error> {
    let mut rng = ChaCha20Rng::seed_from_u64(6);
    let circuits = [Arc::new(adder(3)?)];
    let shared = vec![vec![
        share_matrix(&BitMatrix::random(8, 3, &mut rng), &mut rng),
        share_matrix(&BitMatrix::random(8, 3, &mut rng), &mut rng),
    ]];
    let mut seeds = ring_seeds();
    seeds[1].prev = [0; 16];
    let err = run_parties(&circuits, 8, &shared, seeds, Some(DebugOracle::new()))
        .await
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("reconstructs to a wrong value"), "{err}");
    Ok(())
}
