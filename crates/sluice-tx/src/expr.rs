//! Evaluation of derived-field expressions.

use serde_json::{Map, Value};
use sluice_core::config::Expr;

/// Evaluate `expr` against the record fields.
///
/// Every intermediate value must be finite. Operands must be JSON numbers;
/// numeric strings are not accepted, run a `coerce` step first.
pub fn evaluate(expr: &Expr, fields: &Map<String, Value>) -> Result<f64, String> {
    let value = match expr {
        Expr::Field(name) => match fields.get(name) {
            None | Some(Value::Null) => return Err(format!("field '{name}' is missing or null")),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| format!("field '{name}' is not representable as a float"))?,
            Some(other) => return Err(format!("field '{name}' is not numeric: {other}")),
        },
        Expr::Const(c) => *c,
        Expr::Abs(inner) => evaluate(inner, fields)?.abs(),
        Expr::Log1p(inner) => {
            let x = evaluate(inner, fields)?;
            if x <= -1.0 {
                return Err(format!("log1p of {x} is undefined"));
            }
            x.ln_1p()
        }
        Expr::Add(a, b) => evaluate(a, fields)? + evaluate(b, fields)?,
        Expr::Sub(a, b) => evaluate(a, fields)? - evaluate(b, fields)?,
        Expr::Mul(a, b) => evaluate(a, fields)? * evaluate(b, fields)?,
        Expr::Div(a, b) => {
            let num = evaluate(a, fields)?;
            let den = evaluate(b, fields)?;
            if den == 0.0 {
                return Err("division by zero".to_string());
            }
            num / den
        }
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("expression produced a non-finite value ({value})"))
    }
}
