use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use threefold::circuit::{Circuit, Error, GateType, Levelize, Wire};

// The larger of two unsigned numbers, plus a flag whether `a < b` built from double inversion.
fn max_circuit(bits: usize) -> Result<Circuit, Error> {
    let mut c = Circuit::new(format!("max{bits}"));
    let a = c.add_input_bundle(bits)?;
    let b = c.add_input_bundle(bits)?;
    let max = c.add_output_bundle(bits)?;
    let a_smaller = c.add_output_bundle(1)?;
    // borrow chain of a - b, lsb first
    let mut borrow: Option<Wire> = None;
    for i in 0..bits {
        let t = c.add_temp_bundle(4);
        c.add_gate(a[i], b[i], GateType::Xor, t[0])?;
        c.add_gate(a[i], b[i], GateType::NaAnd, t[1])?;
        match borrow {
            None => c.add_copy(t[1], t[3])?,
            Some(br) => {
                c.add_gate(t[0], br, GateType::NaAnd, t[2])?;
                c.add_gate(t[1], t[2], GateType::Or, t[3])?;
            }
        }
        borrow = Some(t[3]);
    }
    let borrow = borrow.unwrap_or_default();
    for i in 0..bits {
        // max = a ^ (borrow & (a ^ b))
        let t = c.add_temp_bundle(2);
        c.add_gate(a[i], b[i], GateType::Xor, t[0])?;
        c.add_gate(borrow, t[0], GateType::And, t[1])?;
        c.add_gate(a[i], t[1], GateType::Xor, max[i])?;
    }
    let not_borrow = c.add_temp_bundle(1)[0];
    c.add_invert_into(borrow, not_borrow)?;
    c.add_invert_into(not_borrow, a_smaller[0])?;
    Ok(c)
}

fn to_bits(v: u64, bits: usize) -> Vec<bool> {
    (0..bits).map(|i| v >> i & 1 == 1).collect()
}

fn test_vectors(bits: usize) -> Vec<[Vec<bool>; 2]> {
    let mut rng = ChaCha20Rng::seed_from_u64(11);
    let mut vectors = vec![
        [vec![false; bits], vec![false; bits]],
        [vec![true; bits], vec![true; bits]],
    ];
    for _ in 0..20 {
        vectors.push([
            to_bits(rng.random(), bits),
            to_bits(rng.random(), bits),
        ]);
    }
    vectors
}

fn assert_same_results(a: &Circuit, b: &Circuit, bits: usize) -> Result<(), Error> {
    for [x, y] in test_vectors(bits) {
        let inputs = [x, y];
        assert_eq!(a.evaluate(&inputs)?, b.evaluate(&inputs)?);
    }
    Ok(())
}

#[test]
fn and_gate_in_the_clear() -> Result<(), Error> {
    let mut c = Circuit::new("and");
    let x = c.add_input_bundle(1)?;
    let y = c.add_input_bundle(1)?;
    let z = c.add_output_bundle(1)?;
    c.add_gate(x[0], y[0], GateType::And, z[0])?;
    let outputs: Vec<bool> = [(false, false), (false, true), (true, false), (true, true)]
        .into_iter()
        .map(|(a, b)| c.evaluate(&[vec![a], vec![b]]).map(|o| o[0][0]))
        .collect::<Result<_, _>>()?;
    assert_eq!(outputs, vec![false, false, false, true]);
    Ok(())
}

#[test]
fn max_circuit_computes_max() -> Result<(), Error> {
    let c = max_circuit(8)?;
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    for _ in 0..50 {
        let (a, b): (u8, u8) = (rng.random(), rng.random());
        let out = c.evaluate(&[to_bits(a as u64, 8), to_bits(b as u64, 8)])?;
        assert_eq!(out[0], to_bits(a.max(b) as u64, 8));
        assert_eq!(out[1], vec![a < b]);
    }
    Ok(())
}

#[test]
fn binary_round_trip_preserves_hash_and_results() -> Result<(), Error> {
    for mode in [None, Some(Levelize::Reorder), Some(Levelize::NoReorder)] {
        let mut c = max_circuit(6)?;
        if let Some(mode) = mode {
            c.level_by_and_depth(mode)?;
        }
        let decoded = Circuit::from_bytes(&c.to_bytes()?)?;
        assert_eq!(decoded.content_hash(), c.content_hash());
        assert_same_results(&c, &decoded, 6)?;
    }
    Ok(())
}

#[test]
fn json_round_trip_preserves_hash_and_results() -> Result<(), Error> {
    let mut c = max_circuit(5)?;
    c.level_by_and_depth(Levelize::Reorder)?;
    let decoded = Circuit::from_json(&c.to_json()?)?;
    assert_eq!(decoded.content_hash(), c.content_hash());
    assert_eq!(decoded.level_counts(), c.level_counts());
    assert_same_results(&c, &decoded, 5)?;
    Ok(())
}

#[test]
fn bristol_round_trip_preserves_results() -> Result<(), Error> {
    let c = max_circuit(7)?;
    let mut text = vec![];
    c.write_bristol(&mut text)?;
    let decoded = Circuit::read_bristol("max7", text.as_slice())?;
    assert_eq!(decoded.inputs().len(), 2);
    assert_eq!(
        decoded.outputs().iter().map(Vec::len).sum::<usize>(),
        c.outputs().iter().map(Vec::len).sum::<usize>()
    );
    for [x, y] in test_vectors(7) {
        let expected: Vec<bool> = c.evaluate(&[x.clone(), y.clone()])?.concat();
        let actual: Vec<bool> = decoded.evaluate(&[x, y])?.concat();
        assert_eq!(actual, expected);
    }
    Ok(())
}

#[test]
fn levelization_keeps_results_and_counts_depth() -> Result<(), Error> {
    let c = max_circuit(8)?;
    let depth = c.and_depth()?;
    let mut levelled = c.clone();
    levelled.level_by_and_depth(Levelize::Reorder)?;
    assert_same_results(&c, &levelled, 8)?;
    assert_eq!(levelled.non_linear_gate_count(), c.non_linear_gate_count());
    let and_levels = levelled
        .levels()
        .filter(|level| level.and_count > 0)
        .count() as u32;
    assert_eq!(and_levels, depth);
    Ok(())
}

#[test]
fn tampered_files_are_rejected() -> Result<(), Error> {
    let c = max_circuit(3)?;
    let mut bytes = c.to_bytes()?;
    let last = bytes.len() - 1;
    bytes[last] ^= 1;
    assert!(matches!(
        Circuit::from_bytes(&bytes),
        Err(Error::HashMismatch { .. })
    ));
    Ok(())
}
