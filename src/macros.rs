//! Useful macros.

/// Time the given expression, pushing `(label, duration)` onto the `timers` vector, and evaluate
/// to the expression's value.
///
/// ```rust,ignore
/// let mut timers = vec![];
/// let deployment = time!(timers, "Provisioning", manager.provision(&topology, deadline));
/// ```
#[macro_export]
macro_rules! time {
    ($timers:ident, $label:expr, $expr:expr) => {{
        let start = std::time::Instant::now();
        let result = $expr;
        let duration = std::time::Instant::now() - start;
        $timers.push(($label, duration));
        result
    }};
}
