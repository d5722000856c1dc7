// packages/engine/src/script/parser.rs
//! Pest grammar parser for submitted functions

use crate::codec::Value;
use crate::script::ast::*;
use crate::utils::errors::{SourceLocation, ValidationError};
use once_cell::sync::Lazy;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "../grammar/function.pest"]
pub struct FunctionParser;

type ParseResult<T> = std::result::Result<T, ValidationError>;

static PRATT: Lazy<PrattParser<Rule>> = Lazy::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::or, Assoc::Left))
        .op(Op::infix(Rule::and, Assoc::Left))
        .op(Op::infix(Rule::eq, Assoc::Left) | Op::infix(Rule::ne, Assoc::Left))
        .op(Op::infix(Rule::lt, Assoc::Left)
            | Op::infix(Rule::le, Assoc::Left)
            | Op::infix(Rule::gt, Assoc::Left)
            | Op::infix(Rule::ge, Assoc::Left))
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left)
            | Op::infix(Rule::div, Assoc::Left)
            | Op::infix(Rule::rem, Assoc::Left))
        .op(Op::prefix(Rule::neg) | Op::prefix(Rule::not))
        .op(Op::postfix(Rule::index))
});

/// Parse a complete submission into a [`Program`]
pub fn parse_program(source: &str) -> ParseResult<Program> {
    let mut pairs = FunctionParser::parse(Rule::program, source).map_err(syntax_error)?;

    let program = pairs
        .next()
        .ok_or_else(|| ValidationError::new("empty program", None))?;

    let mut imports = Vec::new();
    let mut functions = Vec::new();

    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::import_decl => imports.push(parse_import(pair)?),
            Rule::fn_def => functions.push(parse_fn(pair)?),
            Rule::EOI => {}
            other => return Err(unexpected(other, &pair)),
        }
    }

    Ok(Program { imports, functions })
}

fn syntax_error(e: pest::error::Error<Rule>) -> ValidationError {
    let (line, column) = match e.line_col {
        LineColLocation::Pos(pos) => pos,
        LineColLocation::Span(start, _) => start,
    };
    ValidationError::at(
        format!("syntax error: {}", e.variant.message()),
        SourceLocation::new(line, column),
    )
}

fn location(pair: &Pair<Rule>) -> SourceLocation {
    let (line, column) = pair.as_span().start_pos().line_col();
    SourceLocation::new(line, column)
}

fn unexpected(rule: Rule, pair: &Pair<Rule>) -> ValidationError {
    ValidationError::at(format!("unexpected {:?}", rule), location(pair))
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_fn
            | Rule::kw_let
            | Rule::kw_return
            | Rule::kw_raise
            | Rule::kw_if
            | Rule::kw_else
            | Rule::kw_while
            | Rule::kw_for
            | Rule::kw_in
            | Rule::kw_try
            | Rule::kw_catch
            | Rule::kw_break
            | Rule::kw_continue
            | Rule::kw_import
    )
}

/// Children of a pair without keyword tokens
fn significant(pair: Pair<'_, Rule>) -> impl Iterator<Item = Pair<'_, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

fn expect<'i>(
    parts: &mut impl Iterator<Item = Pair<'i, Rule>>,
    what: &str,
    at: SourceLocation,
) -> ParseResult<Pair<'i, Rule>> {
    parts
        .next()
        .ok_or_else(|| ValidationError::at(format!("expected {}", what), at))
}

fn parse_import(pair: Pair<Rule>) -> ParseResult<Import> {
    let at = location(&pair);
    let mut parts = significant(pair);
    let module = expect(&mut parts, "module name", at)?.as_str().to_string();
    Ok(Import {
        module,
        location: at,
    })
}

fn parse_fn(pair: Pair<Rule>) -> ParseResult<FnDef> {
    let at = location(&pair);
    let mut parts = significant(pair);

    let name = expect(&mut parts, "function name", at)?.as_str().to_string();
    let params = expect(&mut parts, "parameter list", at)?
        .into_inner()
        .map(|p| p.as_str().to_string())
        .collect();
    let body = parse_block(expect(&mut parts, "function body", at)?)?;

    Ok(FnDef {
        name,
        params,
        body,
        location: at,
    })
}

fn parse_block(pair: Pair<Rule>) -> ParseResult<Block> {
    pair.into_inner().map(parse_stmt).collect()
}

fn parse_stmt(pair: Pair<Rule>) -> ParseResult<Stmt> {
    let at = location(&pair);
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ValidationError::at("expected statement", at))?;

    let rule = inner.as_rule();
    if rule == Rule::if_stmt {
        return parse_if(inner);
    }

    let at = location(&inner);
    let mut parts = significant(inner);

    match rule {
        Rule::let_stmt => {
            let name = expect(&mut parts, "variable name", at)?.as_str().to_string();
            let value = parse_expr(expect(&mut parts, "expression", at)?)?;
            Ok(Stmt::Let { name, value })
        }
        Rule::assign_stmt => {
            let target = expect(&mut parts, "assignment target", at)?.as_str().to_string();
            let mut rest: Vec<Pair<Rule>> = parts.collect();
            let value_pair = rest
                .pop()
                .ok_or_else(|| ValidationError::at("expected assigned value", at))?;
            let path = rest
                .into_iter()
                .map(parse_index)
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(Stmt::Assign {
                target,
                path,
                value: parse_expr(value_pair)?,
            })
        }
        Rule::return_stmt => Ok(Stmt::Return(parts.next().map(parse_expr).transpose()?)),
        Rule::raise_stmt => Ok(Stmt::Raise(parse_expr(expect(
            &mut parts,
            "raised value",
            at,
        )?)?)),
        Rule::while_stmt => {
            let cond = parse_expr(expect(&mut parts, "loop condition", at)?)?;
            let body = parse_block(expect(&mut parts, "loop body", at)?)?;
            Ok(Stmt::While {
                cond,
                body,
                location: at,
            })
        }
        Rule::for_stmt => {
            let var = expect(&mut parts, "loop variable", at)?.as_str().to_string();
            let iter = parse_expr(expect(&mut parts, "iterable", at)?)?;
            let body = parse_block(expect(&mut parts, "loop body", at)?)?;
            Ok(Stmt::For { var, iter, body })
        }
        Rule::try_stmt => {
            let body = parse_block(expect(&mut parts, "try block", at)?)?;
            let binding = expect(&mut parts, "catch binding", at)?.as_str().to_string();
            let handler = parse_block(expect(&mut parts, "catch block", at)?)?;
            Ok(Stmt::Try {
                body,
                binding,
                handler,
            })
        }
        Rule::break_stmt => Ok(Stmt::Break),
        Rule::continue_stmt => Ok(Stmt::Continue),
        Rule::expr_stmt => Ok(Stmt::Expr(parse_expr(expect(
            &mut parts,
            "expression",
            at,
        )?)?)),
        other => Err(ValidationError::at(format!("unexpected {:?}", other), at)),
    }
}

fn parse_if(pair: Pair<Rule>) -> ParseResult<Stmt> {
    let at = location(&pair);
    let mut parts = significant(pair);

    let cond = parse_expr(expect(&mut parts, "condition", at)?)?;
    let then = parse_block(expect(&mut parts, "block", at)?)?;
    let otherwise = match parts.next() {
        None => None,
        Some(p) if p.as_rule() == Rule::if_stmt => Some(vec![parse_if(p)?]),
        Some(p) => Some(parse_block(p)?),
    };

    Ok(Stmt::If {
        cond,
        then,
        otherwise,
    })
}

fn parse_index(pair: Pair<Rule>) -> ParseResult<Expr> {
    let at = location(&pair);
    let mut parts = pair.into_inner();
    parse_expr(expect(&mut parts, "index expression", at)?)
}

fn parse_expr(pair: Pair<Rule>) -> ParseResult<Expr> {
    PRATT
        .map_primary(|primary| parse_primary(primary))
        .map_prefix(|op, rhs| {
            let op = match op.as_rule() {
                Rule::neg => UnaryOp::Neg,
                Rule::not => UnaryOp::Not,
                other => return Err(unexpected(other, &op)),
            };
            Ok(Expr::Unary {
                op,
                expr: Box::new(rhs?),
            })
        })
        .map_postfix(|lhs, op| {
            let index = parse_index(op)?;
            Ok(Expr::Index {
                target: Box::new(lhs?),
                index: Box::new(index),
            })
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::or => BinaryOp::Or,
                Rule::and => BinaryOp::And,
                Rule::eq => BinaryOp::Eq,
                Rule::ne => BinaryOp::Ne,
                Rule::lt => BinaryOp::Lt,
                Rule::le => BinaryOp::Le,
                Rule::gt => BinaryOp::Gt,
                Rule::ge => BinaryOp::Ge,
                Rule::add => BinaryOp::Add,
                Rule::sub => BinaryOp::Sub,
                Rule::mul => BinaryOp::Mul,
                Rule::div => BinaryOp::Div,
                Rule::rem => BinaryOp::Rem,
                other => return Err(unexpected(other, &op)),
            };
            Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs?),
                rhs: Box::new(rhs?),
            })
        })
        .parse(pair.into_inner())
}

fn parse_primary(pair: Pair<Rule>) -> ParseResult<Expr> {
    let at = location(&pair);

    match pair.as_rule() {
        Rule::int => pair
            .as_str()
            .parse::<i64>()
            .map(|i| Expr::Const(Value::Int(i)))
            .map_err(|_| ValidationError::at("integer literal out of range", at)),
        Rule::float => pair
            .as_str()
            .parse::<f64>()
            .map(|f| Expr::Const(Value::Float(f)))
            .map_err(|_| ValidationError::at("invalid float literal", at)),
        Rule::string => Ok(Expr::Const(Value::Str(parse_string(pair)))),
        Rule::boolean => Ok(Expr::Const(Value::Bool(pair.as_str() == "true"))),
        Rule::null => Ok(Expr::Const(Value::Null)),
        Rule::ident => Ok(Expr::Var(pair.as_str().to_string())),
        Rule::list => Ok(Expr::List(
            pair.into_inner()
                .map(parse_expr)
                .collect::<ParseResult<Vec<_>>>()?,
        )),
        Rule::map => {
            let mut entries = Vec::new();
            for entry in pair.into_inner() {
                let entry_at = location(&entry);
                let mut parts = entry.into_inner();
                let key = parse_string(expect(&mut parts, "map key", entry_at)?);
                let value = parse_expr(expect(&mut parts, "map value", entry_at)?)?;
                entries.push((key, value));
            }
            Ok(Expr::Map(entries))
        }
        Rule::call => parse_call(pair).map(Expr::Call),
        Rule::expr => parse_expr(pair),
        other => Err(ValidationError::at(format!("unexpected {:?}", other), at)),
    }
}

fn parse_call(pair: Pair<Rule>) -> ParseResult<Call> {
    let at = location(&pair);
    let mut parts = pair.into_inner();

    let callee_pair = expect(&mut parts, "callee", at)?;
    let mut names = callee_pair.into_inner();
    let first = expect(&mut names, "function name", at)?.as_str().to_string();

    let callee = match (names.next(), names.next()) {
        (None, _) => Callee::Local(first),
        (Some(sep), Some(second)) if sep.as_str() == "::" => Callee::Remote {
            namespace: first,
            name: second.as_str().to_string(),
        },
        (Some(_), Some(second)) => Callee::Module {
            module: first,
            member: second.as_str().to_string(),
        },
        (Some(_), None) => return Err(ValidationError::at("incomplete qualified name", at)),
    };

    let args = match parts.next() {
        Some(args) => args
            .into_inner()
            .map(parse_expr)
            .collect::<ParseResult<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(Call {
        callee,
        args,
        location: at,
    })
}

fn parse_string(pair: Pair<Rule>) -> String {
    let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_imports_and_functions() {
        let program = parse_program(
            r#"
            import json;
            # helper
            fn double(x) { return x * 2; }
            fn main(input) { return double(input["n"]); }
            "#,
        )
        .unwrap();

        assert_eq!(program.imports.len(), 1);
        assert_eq!(program.imports[0].module, "json");
        assert_eq!(program.functions.len(), 2);
        assert_eq!(program.functions[0].params, vec!["x".to_string()]);
        assert_eq!(program.functions[1].location.line, 5);
    }

    #[test]
    fn test_operator_precedence() {
        let program = parse_program("fn f() { return 1 + 2 * 3; }").unwrap();
        let Stmt::Return(Some(expr)) = &program.functions[0].body[0] else {
            panic!("expected return");
        };
        match expr {
            Expr::Binary { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(**rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unary_binds_looser_than_index() {
        let program = parse_program("fn f(x) { return -x[0]; }").unwrap();
        let Stmt::Return(Some(expr)) = &program.functions[0].body[0] else {
            panic!("expected return");
        };
        match expr {
            Expr::Unary { op: UnaryOp::Neg, expr } => {
                assert!(matches!(**expr, Expr::Index { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_forms() {
        let program =
            parse_program("fn f(x) { json.encode(x); utils::slug(x); helper(); }").unwrap();
        let callees: Vec<Callee> = program.functions[0]
            .body
            .iter()
            .map(|stmt| match stmt {
                Stmt::Expr(Expr::Call(call)) => call.callee.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(
            callees,
            vec![
                Callee::Module {
                    module: "json".into(),
                    member: "encode".into()
                },
                Callee::Remote {
                    namespace: "utils".into(),
                    name: "slug".into()
                },
                Callee::Local("helper".into()),
            ]
        );
    }

    #[test]
    fn test_control_flow_statements() {
        let program = parse_program(
            r#"
            fn f(items) {
                let total = 0;
                for item in items {
                    if item > 10 { break; } else if item < 0 { continue; } else { total = total + item; }
                }
                try { raise "boom"; } catch e { total = -1; }
                return total;
            }
            "#,
        )
        .unwrap();
        let body = &program.functions[0].body;
        assert_eq!(body.len(), 4);
        assert!(matches!(body[1], Stmt::For { .. }));
        assert!(matches!(body[2], Stmt::Try { .. }));
    }

    #[test]
    fn test_assignment_with_index_path() {
        let program = parse_program(r#"fn f(m) { m["a"]["b"] = 1; return m; }"#).unwrap();
        match &program.functions[0].body[0] {
            Stmt::Assign { target, path, .. } => {
                assert_eq!(target, "m");
                assert_eq!(path.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_escapes() {
        let program = parse_program(r#"fn f() { return "a\"b\n"; }"#).unwrap();
        assert_eq!(
            program.functions[0].body[0],
            Stmt::Return(Some(Expr::Const(Value::str("a\"b\n"))))
        );
    }

    #[test]
    fn test_identifiers_may_start_with_keywords() {
        let program = parse_program("fn f(input, format) { let iffy = input; return iffy; }");
        assert!(program.is_ok());
    }

    #[test]
    fn test_syntax_error_has_location() {
        let err = parse_program("fn f() {\n  let = 3;\n}").unwrap_err();
        assert!(err.reason.starts_with("syntax error"));
        assert_eq!(err.location.map(|l| l.line), Some(2));
    }

    #[test]
    fn test_keyword_is_not_an_identifier() {
        assert!(parse_program("fn while() { return 1; }").is_err());
    }
}
