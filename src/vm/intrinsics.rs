//! Float helpers shared by the interpreter and compiled code.
//!
//! Compiled code calls these through their C ABI so both execution paths
//! produce identical bits.

pub extern "C" fn sin(x: f64) -> f64 {
    x.sin()
}

pub extern "C" fn cos(x: f64) -> f64 {
    x.cos()
}

pub extern "C" fn tan(x: f64) -> f64 {
    x.tan()
}

pub extern "C" fn asin(x: f64) -> f64 {
    x.asin()
}

pub extern "C" fn acos(x: f64) -> f64 {
    x.acos()
}

pub extern "C" fn atan2(y: f64, x: f64) -> f64 {
    y.atan2(x)
}

pub extern "C" fn ln(x: f64) -> f64 {
    x.ln()
}

pub extern "C" fn exp(x: f64) -> f64 {
    x.exp()
}

pub extern "C" fn pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// Float to integer the way CVTTSD2SI does it: truncate toward zero, and
/// produce `i64::MIN` for NaN or out-of-range input.
pub fn truncate(x: f64) -> i64 {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if x.is_nan() || x >= LIMIT || x < -LIMIT {
        i64::MIN
    } else {
        x as i64
    }
}
