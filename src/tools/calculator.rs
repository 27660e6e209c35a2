//! 计算器工具：对简单算术表达式求值
//!
//! 支持 + - * / % 与 **（乘方，右结合）、括号、一元正负号和小数。
//! 表达式格式错误、除以零或嵌套超过 MAX_DEPTH 层时返回 ToolError::ExecutionFailed。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::{parameters_schema, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
struct CalculatorArgs {
    /// Arithmetic expression to evaluate, e.g. '2 + 3' or '10 * 5'
    expression: String,
}

/// 计算器工具
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator_tool"
    }

    fn description(&self) -> &str {
        "Evaluate a simple arithmetic expression (e.g. '2 + 3', '10 * 5')."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<CalculatorArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let args: CalculatorArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let value = evaluate(&args.expression)
            .map_err(|e| ToolError::ExecutionFailed(format!("Calculation error: {e}")))?;
        Ok(format_number(value))
    }
}

/// 整数结果不带小数点（"5" 而不是 "5.0"）
fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => {
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(n));
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// 括号与一元运算符的最大嵌套层数；递归深度受此限制，不会耗尽栈
const MAX_DEPTH: usize = 256;

/// 递归下降：expr := term (('+'|'-') term)*
///           term := unary (('*'|'/'|'%') unary)*
///           unary := ('+'|'-') unary | power
///           power := primary ('**' unary)?
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == Token::Plus { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        while let Some(op @ (Token::Star | Token::Slash | Token::Percent)) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                Token::Star => value * rhs,
                _ if rhs == 0.0 => return Err("division by zero".to_string()),
                Token::Slash => value / rhs,
                _ => value - rhs * (value / rhs).floor(),
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.nested(Self::unary)?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.nested(Self::unary)
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.primary()?;
        if self.peek() == Some(Token::Pow) {
            self.pos += 1;
            let exp = self.nested(Self::unary)?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.nested(Self::expr)?;
                match self.next() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(t) => Err(format!("unexpected token {t:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// 对表达式求值
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing input at token {}", parser.pos));
    }
    if !value.is_finite() {
        return Err("result is not finite".to_string());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3").unwrap(), 5.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("-2 ** 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ** 3 ** 2").unwrap(), 512.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
        assert_eq!(evaluate("7 / 2").unwrap(), 3.5);
    }

    #[test]
    fn test_errors() {
        assert!(evaluate("1 / 0").unwrap_err().contains("division by zero"));
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 2").is_err());
        assert!(evaluate("import os").is_err());
        assert!(evaluate("").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        assert_eq!(evaluate(&parens).unwrap_err(), "expression nested too deeply");

        let signs = format!("{}1", "-".repeat(200_000));
        assert_eq!(evaluate(&signs).unwrap_err(), "expression nested too deeply");

        let towers = format!("2{}", " ** 1".repeat(20_000));
        assert!(evaluate(&towers).is_err());

        // 限制以内的嵌套照常求值
        let ok = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&ok).unwrap(), 1.0);
        assert_eq!(evaluate("--3").unwrap(), 3.0);
    }

    #[tokio::test]
    async fn test_tool_reports_deep_nesting_as_failure() {
        let expression = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        let err = CalculatorTool
            .execute(json!({ "expression": expression }))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::ExecutionFailed("Calculation error: expression nested too deeply".to_string())
        );
    }

    #[tokio::test]
    async fn test_tool_formats_integers() {
        let out = CalculatorTool
            .execute(json!({"expression": "2 + 3"}))
            .await
            .unwrap();
        assert_eq!(out, "5");

        let out = CalculatorTool
            .execute(json!({"expression": "10 / 4"}))
            .await
            .unwrap();
        assert_eq!(out, "2.5");
    }

    #[tokio::test]
    async fn test_tool_errors() {
        let err = CalculatorTool
            .execute(json!({"expression": "1 / 0"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));

        let err = CalculatorTool.execute(json!({"expr": "1"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
