// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query binding helpers.
//!
//! - [`rebind`]: translate `?` placeholders into a dialect's native form
//! - [`named`]: expand `:name` parameters into positional placeholders
//! - [`expand_in`]: fan slice-valued arguments out into `IN (?, ?, ...)`
//!
//! All helpers are pure string transforms; they skip single-quoted string
//! literals, and `named` additionally skips Postgres `::type` casts.

use std::collections::HashMap;

use crate::driver::{Placeholder, Value};
use crate::error::{Error, Result};

/// Translate `?` placeholders to the given dialect.
///
/// For [`Placeholder::Question`] the query is returned unchanged. For
/// [`Placeholder::Dollar`] each `?` becomes `$1..$N` in order. A doubled
/// `??` escapes to a literal `?`. Placeholders inside single-quoted string
/// literals are left alone.
#[must_use]
pub fn rebind(query: &str, placeholder: Placeholder) -> String {
    if placeholder == Placeholder::Question {
        return query.to_string();
    }

    let mut out = String::with_capacity(query.len() + 8);
    let mut ordinal = 0usize;
    let mut in_string = false;
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '?' if !in_string => {
                if chars.peek() == Some(&'?') {
                    chars.next();
                    out.push('?');
                } else {
                    ordinal += 1;
                    out.push('$');
                    out.push_str(&ordinal.to_string());
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Expand `:name` parameters into `?` placeholders and an ordered argument
/// list. The same parameter may appear any number of times; each occurrence
/// binds its value again. Run the result through [`rebind`] for non-`?`
/// dialects.
///
/// # Errors
///
/// Returns [`Error::Bind`] when the query references a parameter missing
/// from `params`.
pub fn named(query: &str, params: &HashMap<String, Value>) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(query.len());
    let mut args = Vec::new();
    let mut in_string = false;
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            ':' if !in_string => {
                if chars.peek() == Some(&':') {
                    // Postgres cast, not a parameter.
                    chars.next();
                    out.push_str("::");
                    continue;
                }

                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }

                if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
                    out.push(':');
                    out.push_str(&name);
                    continue;
                }

                let value = params
                    .get(&name)
                    .ok_or_else(|| Error::Bind(format!("missing named parameter: {name}")))?;
                args.push(value.clone());
                out.push('?');
            }
            _ => out.push(c),
        }
    }

    Ok((out, args))
}

/// Expand slice-valued arguments into per-element placeholders.
///
/// Each `?` in the query consumes one argument. A [`Value::Array`] argument
/// replaces its placeholder with `?, ?, ...` (one per element) and splices
/// the elements into the output arguments; scalar arguments pass through
/// untouched.
///
/// # Errors
///
/// Returns [`Error::Bind`] for an empty slice, a nested slice, or a
/// placeholder/argument count mismatch.
pub fn expand_in(query: &str, args: Vec<Value>) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(query.len());
    let mut out_args = Vec::with_capacity(args.len());
    let mut pending = args.into_iter();
    let mut in_string = false;

    for c in query.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '?' if !in_string => {
                let arg = pending
                    .next()
                    .ok_or_else(|| Error::Bind("more placeholders than arguments".to_string()))?;
                match arg {
                    Value::Array(items) => {
                        if items.is_empty() {
                            return Err(Error::Bind(
                                "empty slice passed to IN expansion".to_string(),
                            ));
                        }
                        for (i, item) in items.into_iter().enumerate() {
                            if matches!(item, Value::Array(_)) {
                                return Err(Error::Bind(
                                    "nested slice passed to IN expansion".to_string(),
                                ));
                            }
                            if i > 0 {
                                out.push_str(", ");
                            }
                            out.push('?');
                            out_args.push(item);
                        }
                    }
                    scalar => {
                        out.push('?');
                        out_args.push(scalar);
                    }
                }
            }
            _ => out.push(c),
        }
    }

    if pending.next().is_some() {
        return Err(Error::Bind("more arguments than placeholders".to_string()));
    }

    Ok((out, out_args))
}
