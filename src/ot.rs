//! Character level edit scripts over byte strings: diff two bodies, apply a script, and transform
//! a script so it can be applied after a concurrent one.

use crate::types::{Op, OpKind};
use crate::error::OtError;

/**
 * Compute an edit script turning `a` into `b` using the classic edit distance table. This is
 * O(|a| * |b|) in both time and space.
 *
 * The returned ops are sorted by location. When several minimal scripts exist, walking back from
 * the end we keep matching characters where we can, then prefer an insert over a delete. So a
 * replaced character comes out as a delete at `i` followed by an insert at `i + 1`.
 */
// Clients build their batches with this; the server itself only transforms and applies.
#[cfg_attr(not(test), allow(dead_code))]
pub fn diff(a: &[u8], b: &[u8]) -> Vec<Op> {
    let (n, m) = (a.len(), b.len());
    let w = m + 1;
    let mut dp = vec![0usize; (n + 1) * w];

    for j in 0..=m { dp[j] = j; }

    for i in 1..=n {
        dp[i * w] = i;
        for j in 1..=m {
            let mut cost = dp[i * w + j - 1].min(dp[(i - 1) * w + j]) + 1;
            if a[i - 1] == b[j - 1] && dp[(i - 1) * w + j - 1] < cost {
                cost = dp[(i - 1) * w + j - 1];
            }
            dp[i * w + j] = cost;
        }
    }

    let (mut i, mut j) = (n, m);
    let mut ops = Vec::with_capacity(dp[n * w + m]);

    while i > 0 || j > 0 {
        if i == 0 {
            ops.push(Op::insert(i, b[j - 1]));
            j -= 1;
        } else if j == 0 {
            ops.push(Op::delete(i - 1, a[i - 1]));
            i -= 1;
        } else if a[i - 1] == b[j - 1] && dp[i * w + j] == dp[(i - 1) * w + j - 1] {
            i -= 1;
            j -= 1;
        } else if dp[i * w + j] == dp[i * w + j - 1] + 1 {
            ops.push(Op::insert(i, b[j - 1]));
            j -= 1;
        } else {
            ops.push(Op::delete(i - 1, a[i - 1]));
            i -= 1;
        }
    }

    // We walked backwards.
    ops.reverse();
    ops
}

/**
 * Apply an edit script to `s`. Ops must be in increasing location order, as produced by `diff`
 * and `transform`. Inserts emit their byte without advancing through the source; deletes skip one
 * source byte.
 */
pub fn apply(s: &[u8], ops: &[Op]) -> Result<Vec<u8>, OtError> {
    let mut res = Vec::with_capacity(s.len() + ops.len());
    let mut cursor = 0;

    for op in ops {
        if op.is_noop() { continue; }

        if op.loc < cursor {
            return Err(OtError::OutOfOrder { loc: op.loc, cursor });
        }
        let past_end = match op.kind {
            OpKind::Delete => op.loc >= s.len(),
            _ => op.loc > s.len(),
        };
        if past_end {
            return Err(OtError::OutOfBounds { loc: op.loc, len: s.len() });
        }

        res.extend_from_slice(&s[cursor..op.loc]);
        cursor = op.loc;

        match op.kind {
            OpKind::Insert => res.push(op.ch),
            OpKind::Delete => cursor += 1,
            OpKind::NoOp => unreachable!(),
        }
    }

    res.extend_from_slice(&s[cursor..]);
    Ok(res)
}

fn shift(op: Op, delta: isize) -> Op {
    let loc = (op.loc as isize + delta).max(0) as usize;
    Op { loc, ..op }
}

/**
 * Rewrite `o2` so it can be applied after `o1`. Both scripts must have been computed against the
 * same body.
 *
 * At a shared location inserts go before deletes, and an insert from `o1` goes before anything in
 * `o2`. If both scripts delete the same character only `o1` gets to delete it: `o2`'s delete
 * becomes a `NoOp` and the offset only moves once.
 */
pub fn transform(o1: &[Op], o2: &[Op]) -> Vec<Op> {
    let mut res = Vec::with_capacity(o2.len());

    let mut i = 0;
    let mut j = 0;
    let mut delta: isize = 0;

    while j < o2.len() {
        let op = o2[j];

        if i < o1.len() && o1[i].is_noop() {
            i += 1;
            continue;
        }

        if op.is_noop() || i == o1.len() || o1[i].loc > op.loc {
            res.push(shift(op, delta));
            j += 1;
        } else if o1[i].loc == op.loc {
            match (o1[i].kind, op.kind) {
                (OpKind::Delete, OpKind::Delete) => {
                    // Already gone.
                    res.push(Op { kind: OpKind::NoOp, ..shift(op, delta) });
                    delta -= 1;
                    i += 1;
                    j += 1;
                }
                (OpKind::Insert, _) => {
                    delta += 1;
                    i += 1;
                }
                _ => {
                    // Our insert lands before their delete.
                    res.push(shift(op, delta));
                    j += 1;
                }
            }
        } else {
            match o1[i].kind {
                OpKind::Insert => delta += 1,
                _ => delta -= 1,
            }
            i += 1;
        }
    }

    res
}
