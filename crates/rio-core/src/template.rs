//! `$name` text templating.
//!
//! Templated string parameters substitute from two sources: the global
//! variables map first, then the current parameter record. Substitution
//! repeats until a full pass changes nothing, so values may themselves
//! contain placeholders; an iteration cap guards against cycles.

use crate::value::ValueMap;

const MAX_PASSES: usize = 8;

/// Expand every `$name` in `template` from `globals`, then `locals`,
/// repeating until stable.
pub fn expand_template(template: &str, globals: &ValueMap, locals: &ValueMap) -> String {
    let mut current = template.to_string();
    for _ in 0..MAX_PASSES {
        let expanded = substitute_pass(&substitute_pass(&current, globals), locals);
        if expanded == current {
            break;
        }
        current = expanded;
    }
    current
}

/// One left-to-right pass replacing `$name` placeholders from `vars`.
/// Unknown names are left intact.
fn substitute_pass(text: &str, vars: &ValueMap) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let name_start = idx + 1;
        let mut name_end = name_start;
        while let Some(&(pos, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                name_end = pos + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        if name_end == name_start {
            result.push('$');
            continue;
        }
        let name = &text[name_start..name_end];
        match vars.get(name) {
            Some(value) => result.push_str(&value.to_text()),
            None => {
                result.push('$');
                result.push_str(name);
            }
        }
    }
    result
}
