//! Sum of two numbers.

use serde_json::{json, Number, Value};
use tasker_core::Parameters;

use super::required;
use crate::registry::{HandlerError, ValidationError};

const TASK: &str = "sum";

/// Adds parameters `a` and `b`.
#[derive(Debug, Clone)]
pub struct SumTask {
    max_abs: f64,
}

impl SumTask {
    /// Create a handler rejecting operands larger than `max_abs` in magnitude.
    pub fn new(max_abs: f64) -> Self {
        Self { max_abs }
    }

    pub fn validate(&self, parameters: &Parameters) -> Result<(), ValidationError> {
        self.operands(parameters).map(|_| ())
    }

    pub fn execute(&self, parameters: &Parameters) -> Result<Value, HandlerError> {
        let (a, b) = self.operands(parameters)?;

        let result = match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => match x.checked_add(y) {
                Some(sum) => Value::from(sum),
                None => float_value(x as f64 + y as f64)?,
            },
            _ => float_value(as_f64(a) + as_f64(b))?,
        };

        Ok(json!({
            "operation": "sum",
            "a": a,
            "b": b,
            "result": result,
        }))
    }

    fn operands<'a>(
        &self,
        parameters: &'a Parameters,
    ) -> Result<(&'a Number, &'a Number), ValidationError> {
        let a = self.operand(parameters, "a")?;
        let b = self.operand(parameters, "b")?;
        Ok((a, b))
    }

    fn operand<'a>(
        &self,
        parameters: &'a Parameters,
        field: &str,
    ) -> Result<&'a Number, ValidationError> {
        let Value::Number(n) = required(parameters, field, TASK)? else {
            return Err(ValidationError::new(
                field,
                format!("Parameter '{field}' must be a number"),
            ));
        };

        let value = as_f64(n);
        if !value.is_finite() {
            return Err(ValidationError::new(
                field,
                format!("Parameter '{field}' must be a finite number"),
            ));
        }
        if value.abs() > self.max_abs {
            return Err(ValidationError::new(
                field,
                format!("Parameter '{field}' exceeds maximum magnitude of {:e}", self.max_abs),
            ));
        }
        Ok(n)
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn float_value(value: f64) -> Result<Value, HandlerError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| HandlerError::InvalidInput("Sum is not a finite number".to_string()))
}
