//! Grouping gates into communication rounds.
use std::{cmp::Reverse, collections::BinaryHeap};

use tracing::{debug, instrument, warn};

use super::{Circuit, Error, Gate, GateType, Result, Wire, WireFlag};

/// How [`Circuit::level_by_and_depth`] forms levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Levelize {
    /// Sort gates by AND-depth and renumber wires so dead temporaries are reused.
    #[default]
    Reorder,
    /// Keep the gate order and start a new level after every non-linear gate.
    NoReorder,
    /// Keep the gate order and put every gate into its own level.
    SingleGate,
}

// One gate of the copy-expanded gate list, in terms of values instead of wires.
struct Node {
    ty: GateType,
    ins: [usize; 2],
    out: usize,
    level: u32,
}

struct Value {
    // round from which the value can be read
    avail: u32,
    fixed: Option<Wire>,
    last_use: Option<usize>,
}

struct Ssa {
    nodes: Vec<Node>,
    values: Vec<Value>,
    current: Vec<Option<usize>>,
}

const NO_VALUE: usize = usize::MAX;

impl Circuit {
    /// Groups the gates into levels. Afterwards no gate reads the output of a non-linear gate
    /// from its own or a later level, and the clear evaluation result is unchanged.
    ///
    /// [`Levelize::Reorder`] may renumber every wire except inputs and outputs, and drops all
    /// [`super::Print`] annotations because their positions no longer exist.
    #[instrument(level = "debug", skip_all, err, fields(circuit = %self.name, ?mode))]
    pub fn level_by_and_depth(&mut self, mode: Levelize) -> Result<()> {
        match mode {
            Levelize::Reorder => self.reorder()?,
            Levelize::NoReorder => self.cut_levels(Gate::is_non_linear),
            Levelize::SingleGate => self.cut_levels(|_| true),
        }
        debug!(
            levels = self.level_counts.len(),
            gates = self.gates.len(),
            wires = self.wire_count,
            "circuit levelled"
        );
        Ok(())
    }

    /// The number of non-linear gates on the longest path from an input to any wire.
    pub fn and_depth(&self) -> Result<u32> {
        let ssa = self.ssa()?;
        Ok(ssa.values.iter().map(|v| v.avail).max().unwrap_or(0))
    }

    fn cut_levels(&mut self, ends_level: impl Fn(&Gate) -> bool) {
        self.level_counts.clear();
        self.level_and_counts.clear();
        let (mut count, mut and_count) = (0, 0);
        for gate in &self.gates {
            count += 1;
            and_count += gate.is_non_linear() as u32;
            if ends_level(gate) {
                self.level_counts.push(count);
                self.level_and_counts.push(and_count);
                (count, and_count) = (0, 0);
            }
        }
        if count > 0 {
            self.level_counts.push(count);
            self.level_and_counts.push(and_count);
        }
    }

    // Every gate output becomes a fresh value; copies are split into single wires.
    fn ssa(&self) -> Result<Ssa> {
        let n_in = self.input_wire_count() as usize;
        let mut values: Vec<Value> = (0..n_in)
            .map(|w| Value {
                avail: 0,
                fixed: Some(w as Wire),
                last_use: None,
            })
            .collect();
        let mut current: Vec<Option<usize>> = (0..self.wire_count as usize)
            .map(|w| (w < n_in).then_some(w))
            .collect();
        let mut nodes = Vec::with_capacity(self.gates.len());

        let read = |current: &[Option<usize>], w: Wire| {
            current[w as usize].ok_or(Error::UninitializedWire(w))
        };
        let push = |nodes: &mut Vec<Node>, values: &mut Vec<Value>, ty, ins, level, out_avail| {
            values.push(Value {
                avail: out_avail,
                fixed: None,
                last_use: None,
            });
            nodes.push(Node {
                ty,
                ins,
                out: values.len() - 1,
                level,
            });
            values.len() - 1
        };

        for gate in &self.gates {
            if gate.is_copy() {
                for k in 0..gate.in1 {
                    let src = read(&current, gate.in0 + k)?;
                    let level = values[src].avail;
                    let out = push(
                        &mut nodes,
                        &mut values,
                        GateType::A,
                        [src, NO_VALUE],
                        level,
                        level,
                    );
                    current[(gate.out + k) as usize] = Some(out);
                }
            } else {
                let a = read(&current, gate.in0)?;
                let b = read(&current, gate.in1)?;
                let level = values[a].avail.max(values[b].avail);
                let avail = level + gate.is_non_linear() as u32;
                let out = push(&mut nodes, &mut values, gate.ty, [a, b], level, avail);
                current[gate.out as usize] = Some(out);
            }
        }
        Ok(Ssa {
            nodes,
            values,
            current,
        })
    }

    fn reorder(&mut self) -> Result<()> {
        let Ssa {
            nodes,
            mut values,
            current,
        } = self.ssa()?;

        // the final value of every output wire keeps the output's id
        let mut reserved = vec![false; self.wire_count as usize];
        reserved[..self.input_wire_count() as usize].fill(true);
        for &o in self.outputs.iter().flatten() {
            reserved[o as usize] = true;
            if matches!(self.flags[o as usize], WireFlag::Wire | WireFlag::InvWire) {
                if let Some(v) = current[o as usize] {
                    values[v].fixed = Some(o);
                }
            }
        }

        let depth = nodes.iter().map(|n| n.level + 1).max().unwrap_or(0) as usize;
        let mut buckets: Vec<Vec<usize>> = vec![vec![]; depth];
        for (i, node) in nodes.iter().enumerate() {
            buckets[node.level as usize].push(i);
        }
        let order: Vec<usize> = buckets.into_iter().flatten().collect();
        for (pos, &n) in order.iter().enumerate() {
            for &v in &nodes[n].ins {
                if v != NO_VALUE {
                    values[v].last_use = Some(pos);
                }
            }
        }

        let mut wire_of = vec![Wire::MAX; values.len()];
        for (v, value) in values.iter().enumerate() {
            if let Some(w) = value.fixed {
                wire_of[v] = w;
            }
        }
        let mut free = BinaryHeap::new();
        let mut fresh: Wire = 0;
        let mut deferred = vec![];
        let mut level = 0;
        let mut gates: Vec<Gate> = Vec::with_capacity(order.len());
        let mut level_counts = vec![0u32; depth];
        let mut level_and_counts = vec![0u32; depth];

        for (pos, &n) in order.iter().enumerate() {
            let node = &nodes[n];
            if node.level != level {
                level = node.level;
                free.extend(deferred.drain(..).map(Reverse));
            }
            let [a, b] = node.ins;
            let in0 = wire_of[a];
            let in1 = if b == NO_VALUE { 1 } else { wire_of[b] };
            for v in node.ins {
                if v != NO_VALUE && values[v].last_use == Some(pos) && values[v].fixed.is_none() {
                    free.push(Reverse(wire_of[v]));
                }
            }
            let out = match values[node.out].fixed {
                Some(w) => w,
                None => match free.pop() {
                    Some(Reverse(w)) => w,
                    None => {
                        while reserved.get(fresh as usize).copied().unwrap_or(false) {
                            fresh += 1;
                        }
                        fresh += 1;
                        fresh - 1
                    }
                },
            };
            wire_of[node.out] = out;
            let non_linear = !node.ty.is_linear();
            if values[node.out].last_use.is_none() && values[node.out].fixed.is_none() {
                // the partner share of a non-linear output arrives at the end of the level
                if non_linear {
                    deferred.push(out);
                } else {
                    free.push(Reverse(out));
                }
            }

            let gate = Gate {
                in0,
                in1,
                ty: node.ty,
                out,
            };
            level_and_counts[level as usize] += non_linear as u32;
            if let Some(last) = gates.last_mut() {
                let same_level = level_counts[level as usize] > 0;
                if same_level && merges(last, &gate) {
                    last.in1 += 1;
                    continue;
                }
            }
            level_counts[level as usize] += 1;
            gates.push(gate);
        }

        let reserved_end = reserved.iter().rposition(|r| *r).map_or(0, |w| w as Wire + 1);
        let wire_count = fresh.max(reserved_end);
        let mut flags = vec![WireFlag::Wire; wire_count as usize];
        for (w, flag) in flags.iter_mut().enumerate().take(reserved.len()) {
            if reserved[w] {
                *flag = self.flags[w];
            }
        }
        if !self.prints.is_empty() {
            warn!(dropped = self.prints.len(), "reordering drops debug prints");
            self.prints.clear();
        }
        self.gates = gates;
        self.flags = flags;
        self.wire_count = wire_count;
        self.level_counts = level_counts;
        self.level_and_counts = level_and_counts;
        Ok(())
    }
}

// Whether `next` extends the copy run `last` without overlapping it.
fn merges(last: &Gate, next: &Gate) -> bool {
    let len = last.in1;
    last.is_copy()
        && next.is_copy()
        && last.in0 + len == next.in0
        && last.out + len == next.out
        && super::disjoint(last.in0, last.out, len + 1)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::circuit::testing::{random_circuit, test_inputs};

    fn check_levels(c: &Circuit) {
        let total: u32 = c.level_counts().iter().sum();
        assert_eq!(total as usize, c.gate_count());
        let ands: u32 = c.level_and_counts().iter().sum();
        let stored = c.gates().iter().filter(|g| g.is_non_linear()).count();
        assert_eq!(ands as usize, stored);
    }

    proptest! {
        #[test]
        fn levelization_preserves_results(seed: u64, gates in 1usize..60) {
            let original = random_circuit(seed, gates);
            let inputs = test_inputs(seed);
            let expected: Vec<_> = inputs.iter().map(|i| original.evaluate(i).unwrap()).collect();
            for mode in [Levelize::Reorder, Levelize::NoReorder, Levelize::SingleGate] {
                let mut c = original.clone();
                c.level_by_and_depth(mode).unwrap();
                check_levels(&c);
                prop_assert!(c.check_level_order().is_ok(), "{:?}", mode);
                for (input, expected) in inputs.iter().zip(&expected) {
                    prop_assert_eq!(&c.evaluate(input).unwrap(), expected, "{:?}", mode);
                }
            }
        }
    }

    #[test]
    fn levels_follow_and_depth() {
        let mut c = Circuit::new("chain");
        let x = c.add_input_bundle(4).unwrap();
        let out = c.add_output_bundle(2).unwrap();
        let t = c.add_temp_bundle(3);
        c.add_gate(x[0], x[1], GateType::And, t[0]).unwrap();
        c.add_gate(t[0], x[2], GateType::And, t[1]).unwrap();
        c.add_gate(x[2], x[3], GateType::Xor, t[2]).unwrap();
        c.add_gate(t[1], t[2], GateType::Xor, out[0]).unwrap();
        c.add_gate(x[0], x[3], GateType::Or, out[1]).unwrap();
        assert_eq!(c.and_depth().unwrap(), 2);
        c.level_by_and_depth(Levelize::Reorder).unwrap();
        assert_eq!(c.level_counts(), &[3, 1, 1]);
        assert_eq!(c.level_and_counts(), &[2, 1, 0]);
        // one temp remains live across each level boundary at most
        assert!(c.wire_count() <= 8);
        check_levels(&c);
    }

    #[test]
    fn no_reorder_cuts_after_non_linear_gates() {
        let mut c = Circuit::new("cut");
        let x = c.add_input_bundle(3).unwrap();
        let out = c.add_output_bundle(1).unwrap();
        let t = c.add_temp_bundle(2);
        c.add_gate(x[0], x[1], GateType::Xor, t[0]).unwrap();
        c.add_gate(t[0], x[2], GateType::And, t[1]).unwrap();
        c.add_gate(t[1], x[0], GateType::Xor, out[0]).unwrap();
        let mut single = c.clone();
        c.level_by_and_depth(Levelize::NoReorder).unwrap();
        assert_eq!(c.level_counts(), &[2, 1]);
        assert_eq!(c.level_and_counts(), &[1, 0]);
        single.level_by_and_depth(Levelize::SingleGate).unwrap();
        assert_eq!(single.level_counts(), &[1, 1, 1]);
    }

    #[test]
    fn reorder_drops_prints() {
        let mut c = Circuit::new("print");
        let x = c.add_input_bundle(2).unwrap();
        let out = c.add_output_bundle(1).unwrap();
        c.add_print_wire("x0=", x[0]).unwrap();
        c.add_gate(x[0], x[1], GateType::And, out[0]).unwrap();
        let mut kept = c.clone();
        kept.level_by_and_depth(Levelize::NoReorder).unwrap();
        assert_eq!(kept.prints().len(), 1);
        c.level_by_and_depth(Levelize::Reorder).unwrap();
        assert!(c.prints().is_empty());
    }

    #[test]
    fn dead_non_linear_outputs_are_not_reused_in_their_level() {
        let mut c = Circuit::new("dead");
        let x = c.add_input_bundle(3).unwrap();
        let out = c.add_output_bundle(1).unwrap();
        let t = c.add_temp_bundle(2);
        // t[0] is never read
        c.add_gate(x[0], x[1], GateType::And, t[0]).unwrap();
        c.add_gate(x[1], x[2], GateType::Xor, t[1]).unwrap();
        c.add_gate(t[1], x[0], GateType::And, out[0]).unwrap();
        c.level_by_and_depth(Levelize::Reorder).unwrap();
        let level0 = c.levels().next().unwrap();
        let and_out = level0.gates.iter().find(|g| g.is_non_linear()).unwrap().out;
        assert!(level0.gates.iter().filter(|g| g.out == and_out).count() == 1);
    }

    #[test]
    fn uninitialized_read_is_reported() {
        let mut c = Circuit::new("bad");
        c.add_input_bundle(2).unwrap();
        let t = c.add_temp_bundle(1);
        c.gates.push(Gate {
            in0: 0,
            in1: t[0],
            ty: GateType::And,
            out: t[0],
        });
        assert!(matches!(
            c.level_by_and_depth(Levelize::Reorder),
            Err(Error::UninitializedWire(_))
        ));
    }
}
