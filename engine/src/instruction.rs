//! The instruction language: token parsing and the parenthesis-driven, no-precedence `math`
//! expression evaluator. Pure, synchronous logic; the CPU module owns all blocking/mailbox
//! concerns around it.

use crate::error::CpuFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            ">" => Some(CompareOp::Gt),
            "<=" => Some(CompareOp::Le),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    /// Compares as `f64` when both sides parse as numbers, else lexically, per §4.4.
    pub fn evaluate(self, lhs: &str, rhs: &str) -> bool {
        if let (Ok(l), Ok(r)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
            match self {
                CompareOp::Eq => l == r,
                CompareOp::Ne => l != r,
                CompareOp::Lt => l < r,
                CompareOp::Gt => l > r,
                CompareOp::Le => l <= r,
                CompareOp::Ge => l >= r,
            }
        } else {
            match self {
                CompareOp::Eq => lhs == rhs,
                CompareOp::Ne => lhs != rhs,
                CompareOp::Lt => lhs < rhs,
                CompareOp::Gt => lhs > rhs,
                CompareOp::Le => lhs <= rhs,
                CompareOp::Ge => lhs >= rhs,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Null,
    Var { name: String, addr: usize, value: Option<String> },
    Alloc(usize),
    Free(usize),
    Exit,
    Jump(String),
    JumpIf { lhs: String, op: CompareOp, rhs: String, label: String },
    Set { lhs: String, rhs: String },
    Out(String),
    Inc(String),
    Dec(String),
    Math { target: String, expr: String },
}

/// Strips a leading `label:` prefix, if present, returning the rest of the line. A bare `label:`
/// with no trailing instruction is treated as `null`.
pub fn strip_label(line: &str) -> &str {
    if let Some(colon) = line.find(':') {
        let (head, rest) = line.split_at(colon);
        if head.chars().all(|c| c.is_alphanumeric() || c == '_') && !head.is_empty() {
            return rest[1..].trim_start();
        }
    }
    line
}

/// One pass over the program source recording `label -> line_index` for every line of the form
/// `name:rest`.
pub fn scan_labels(source: &str) -> std::collections::HashMap<String, usize> {
    let mut labels = std::collections::HashMap::new();
    for (idx, line) in source.lines().enumerate() {
        if let Some(colon) = line.find(':') {
            let head = &line[..colon];
            if !head.is_empty() && head.chars().all(|c| c.is_alphanumeric() || c == '_') {
                labels.insert(head.to_string(), idx);
            }
        }
    }
    labels
}

pub fn parse(line: &str) -> Result<Instruction, CpuFault> {
    let line = strip_label(line);
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() { return Ok(Instruction::Null); }
    match tokens[0] {
        "null" => Ok(Instruction::Null),
        "var" => {
            let name = *tokens.get(1).ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?;
            let addr: usize = tokens
                .get(2)
                .ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?
                .parse()
                .map_err(|_| CpuFault::NotANumber(tokens[2].to_string()))?;
            let value = tokens.get(3).map(|v| v.to_string());
            Ok(Instruction::Var { name: name.to_string(), addr, value })
        }
        "alloc" => {
            let n = parse_usize(&tokens, 1, line)?;
            Ok(Instruction::Alloc(n))
        }
        "free" => {
            let n = parse_usize(&tokens, 1, line)?;
            Ok(Instruction::Free(n))
        }
        "exit" => Ok(Instruction::Exit),
        "jump" => {
            let label = tokens.get(1).ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?;
            Ok(Instruction::Jump(label.to_string()))
        }
        "jumpif" => {
            if tokens.len() < 5 { return Err(CpuFault::UnknownOpcode(line.to_string())); }
            let op = CompareOp::parse(tokens[2]).ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?;
            Ok(Instruction::JumpIf {
                lhs: tokens[1].to_string(),
                op,
                rhs: tokens[3].to_string(),
                label: tokens[4].to_string(),
            })
        }
        "set" => {
            if tokens.len() < 3 { return Err(CpuFault::UnknownOpcode(line.to_string())); }
            Ok(Instruction::Set { lhs: tokens[1].to_string(), rhs: tokens[2].to_string() })
        }
        "out" => {
            let name = tokens.get(1).ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?;
            Ok(Instruction::Out(name.to_string()))
        }
        "inc" => {
            let name = tokens.get(1).ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?;
            Ok(Instruction::Inc(name.to_string()))
        }
        "dec" => {
            let name = tokens.get(1).ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?;
            Ok(Instruction::Dec(name.to_string()))
        }
        "math" => {
            let rest = line["math".len()..].trim();
            let eq = rest.find('=').ok_or_else(|| CpuFault::MalformedMath(rest.to_string()))?;
            let target = rest[..eq].trim().to_string();
            let expr = rest[eq + 1..].chars().filter(|c| !c.is_whitespace()).collect();
            Ok(Instruction::Math { target, expr })
        }
        other => Err(CpuFault::UnknownOpcode(other.to_string())),
    }
}

fn parse_usize(tokens: &[&str], idx: usize, line: &str) -> Result<usize, CpuFault> {
    tokens
        .get(idx)
        .ok_or_else(|| CpuFault::UnknownOpcode(line.to_string()))?
        .parse()
        .map_err(|_| CpuFault::NotANumber(tokens[idx].to_string()))
}

/// Returns every operand token in `expr` that is not itself a number literal, in left-to-right
/// order, duplicates included. These are the names the CPU must resolve (phase one of `math`).
pub fn operand_names(expr: &str) -> Vec<String> {
    split_operands(expr).into_iter().filter(|t| t.parse::<f64>().is_err()).collect()
}

fn split_operands(expr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in expr.chars() {
        if matches!(c, '+' | '-' | '*' | '/' | '%' | '(' | ')') {
            if !current.is_empty() { out.push(std::mem::take(&mut current)); }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() { out.push(current); }
    out
}

/// Phase two: substitute each non-literal operand in `expr`, in left-to-right order, with the
/// corresponding value from `values` (one value per occurrence, matching the order
/// `operand_names` produced them in), then evaluate innermost-parenthesis-first, left-to-right,
/// with no operator precedence.
pub fn evaluate(expr: &str, values: &[String]) -> Result<f64, CpuFault> {
    let substituted = substitute(expr, values)?;
    let mut working = substituted;
    loop {
        match innermost_paren(&working) {
            Some((open, close)) => {
                let inner_value = eval_flat(&working[open + 1..close])?;
                working.replace_range(open..=close, &format!("{inner_value}"));
            }
            None => break,
        }
    }
    eval_flat(&working)
}

fn substitute(expr: &str, values: &[String]) -> Result<String, CpuFault> {
    let mut out = String::new();
    let mut current = String::new();
    let mut value_iter = values.iter();
    let flush = |current: &mut String, out: &mut String, value_iter: &mut std::slice::Iter<String>| -> Result<(), CpuFault> {
        if current.is_empty() { return Ok(()); }
        if current.parse::<f64>().is_ok() {
            out.push_str(current);
        } else {
            let v = value_iter.next().ok_or_else(|| CpuFault::MalformedMath(current.clone()))?;
            out.push_str(v);
        }
        current.clear();
        Ok(())
    };
    for c in expr.chars() {
        if matches!(c, '+' | '-' | '*' | '/' | '%' | '(' | ')') {
            flush(&mut current, &mut out, &mut value_iter)?;
            out.push(c);
        } else {
            current.push(c);
        }
    }
    flush(&mut current, &mut out, &mut value_iter)?;
    Ok(out)
}

fn innermost_paren(expr: &str) -> Option<(usize, usize)> {
    let open = expr.rfind('(')?;
    let close = expr[open..].find(')')? + open;
    Some((open, close))
}

/// Evaluates a flat (parenthesis-free) expression strictly left-to-right, no precedence.
fn eval_flat(expr: &str) -> Result<f64, CpuFault> {
    if expr.is_empty() { return Err(CpuFault::MalformedMath(expr.to_string())); }
    let mut chars = expr.char_indices().peekable();
    let mut acc: Option<f64> = None;
    let mut pending_op: Option<char> = None;
    let mut number = String::new();
    let mut apply = |acc: &mut Option<f64>, op: Option<char>, rhs: f64| -> Result<(), CpuFault> {
        *acc = Some(match (*acc, op) {
            (None, _) => rhs,
            (Some(lhs), Some('+')) => lhs + rhs,
            (Some(lhs), Some('-')) => lhs - rhs,
            (Some(lhs), Some('*')) => lhs * rhs,
            (Some(lhs), Some('/')) => lhs / rhs,
            (Some(lhs), Some('%')) => lhs % rhs,
            _ => return Err(CpuFault::MalformedMath(expr.to_string())),
        });
        Ok(())
    };
    while let Some((_, c)) = chars.next() {
        if matches!(c, '+' | '-' | '*' | '/' | '%') && !number.is_empty() {
            let value: f64 = number.parse().map_err(|_| CpuFault::NotANumber(number.clone()))?;
            apply(&mut acc, pending_op, value)?;
            number.clear();
            pending_op = Some(c);
        } else {
            number.push(c);
        }
    }
    if number.is_empty() { return Err(CpuFault::MalformedMath(expr.to_string())); }
    let value: f64 = number.parse().map_err(|_| CpuFault::NotANumber(number.clone()))?;
    apply(&mut acc, pending_op, value)?;
    acc.ok_or_else(|| CpuFault::MalformedMath(expr.to_string()))
}

/// Formats a computed numeric value the way `inc`/`dec`/`math` write their results back: always
/// with a decimal point (`5` -> `"5.0"`), matching the original simulator's double formatting.
pub fn format_double(value: f64) -> String { format!("{value:?}") }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_var_with_value() {
        assert_eq!(
            parse("var x 0 5").unwrap(),
            Instruction::Var { name: "x".into(), addr: 0, value: Some("5".into()) }
        );
    }

    #[test]
    fn parses_label_prefixed_line() {
        assert_eq!(parse("end: exit").unwrap(), Instruction::Exit);
    }

    #[test]
    fn scans_labels() {
        let src = "null\nend:exit\njump end\n";
        let labels = scan_labels(src);
        assert_eq!(labels.get("end"), Some(&1));
    }

    #[test]
    fn compare_numeric_vs_lexical() {
        assert!(CompareOp::Eq.evaluate("2", "2.0"));
        assert!(!CompareOp::Eq.evaluate("1", "2"));
        assert!(CompareOp::Lt.evaluate("abc", "abd"));
    }

    #[test]
    fn math_scenario_from_spec() {
        // math z=(x+y)*2 with x=10, y=3 -> 26.0
        let expr = "(x+y)*2";
        let names = operand_names(expr);
        assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
        let values = vec!["10".to_string(), "3".to_string()];
        let result = evaluate(expr, &values).unwrap();
        assert_eq!(result, 26.0);
        assert_eq!(format_double(result), "26.0");
    }

    #[test]
    fn math_is_left_to_right_no_precedence() {
        // 2+3*4 evaluated strictly left to right is (2+3)*4 = 20, not 14.
        let result = evaluate("2+3*4", &[]).unwrap();
        assert_eq!(result, 20.0);
    }

    #[test]
    fn inc_style_formatting_keeps_decimal() {
        assert_eq!(format_double(5.0), "5.0");
    }
}
