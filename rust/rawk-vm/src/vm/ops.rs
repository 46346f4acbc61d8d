//! Arithmetic, comparison, and regex matching for the VM.

use super::*;
use std::cmp::Ordering;

/// Apply an arithmetic opcode to two numbers.
pub(crate) fn arith(op: Op, left: f64, right: f64) -> Result<f64, VmError> {
    Ok(match op {
        Op::Add => left + right,
        Op::Subtract => left - right,
        Op::Multiply => left * right,
        Op::Divide => {
            if right == 0.0 {
                return Err(VmError::DivisionByZero);
            }
            left / right
        }
        Op::Modulo => {
            if right == 0.0 {
                return Err(VmError::DivisionByZeroMod);
            }
            left % right
        }
        Op::Power => left.powf(right),
        other => {
            return Err(VmError::Runtime(format!(
                "{} is not an arithmetic op",
                other.name()
            )))
        }
    })
}

/// Apply the operator of `x op= y`.
pub(crate) fn aug(op: AugOp, left: f64, right: f64) -> Result<f64, VmError> {
    let op = match op {
        AugOp::Add => Op::Add,
        AugOp::Sub => Op::Subtract,
        AugOp::Mul => Op::Multiply,
        AugOp::Div => Op::Divide,
        AugOp::Mod => Op::Modulo,
        AugOp::Pow => Op::Power,
    };
    arith(op, left, right)
}

/// Whether the comparison named by `op` (plain or fused with a jump)
/// holds for `ord`.
pub(crate) fn holds(op: Op, ord: Ordering) -> bool {
    match op {
        Op::Equals | Op::JumpEquals(_) => ord == Ordering::Equal,
        Op::NotEquals | Op::JumpNotEquals(_) => ord != Ordering::Equal,
        Op::Less | Op::JumpLess(_) => ord == Ordering::Less,
        Op::Greater | Op::JumpGreater(_) => ord == Ordering::Greater,
        Op::LessOrEqual | Op::JumpLessOrEqual(_) => ord != Ordering::Greater,
        Op::GreaterOrEqual | Op::JumpGreaterOrEqual(_) => ord != Ordering::Less,
        _ => false,
    }
}

impl VM {
    /// `text ~ pattern` with a dynamic pattern.
    pub(crate) fn regex_match(&mut self, text: &Value, pattern: &Value) -> Result<bool, VmError> {
        let re = self
            .regex_cache
            .get(&pattern.to_str(&self.specials.convfmt))?;
        Ok(re.is_match(&text.to_str(&self.specials.convfmt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arith() {
        assert_eq!(arith(Op::Add, 2.0, 3.0).unwrap(), 5.0);
        assert_eq!(arith(Op::Modulo, -7.0, 3.0).unwrap(), -1.0);
        assert_eq!(arith(Op::Power, 2.0, 0.5).unwrap(), 2f64.sqrt());
        assert!(matches!(
            arith(Op::Divide, 1.0, 0.0),
            Err(VmError::DivisionByZero)
        ));
        assert!(matches!(
            arith(Op::Modulo, 1.0, 0.0),
            Err(VmError::DivisionByZeroMod)
        ));
        assert!(arith(Op::Concat, 1.0, 2.0).is_err());
    }

    #[test]
    fn test_aug_maps_to_arith() {
        assert_eq!(aug(AugOp::Mul, 4.0, 2.5).unwrap(), 10.0);
        assert!(matches!(
            aug(AugOp::Div, 1.0, 0.0),
            Err(VmError::DivisionByZero)
        ));
    }

    #[test]
    fn test_holds_for_plain_and_fused() {
        assert!(holds(Op::LessOrEqual, Ordering::Equal));
        assert!(holds(Op::JumpGreaterOrEqual(3), Ordering::Greater));
        assert!(!holds(Op::JumpEquals(0), Ordering::Less));
        assert!(holds(Op::NotEquals, Ordering::Less));
    }
}
