//! Bundle precondition expressions.
//!
//! ```text
//! expr       := term ('||' term)*
//! term       := factor ('&&' factor)*
//! factor     := '!' factor | '(' expr ')' | 'true' | 'false' | comparison
//! comparison := IDENT ('==' | '!=' | '=~') STRING
//! ```
//!
//! Identifiers name host facts; a missing fact compares as the empty string.

use regex::Regex;

use fleet_host::HostFacts;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    Match,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| "dangling escape".to_string())?;
                            value.push(*escaped);
                            i += 2;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}' at {i}")),
        }
    }
    Ok(tokens)
}

/// A parsed precondition.
#[derive(Debug, Clone)]
pub enum Condition {
    Literal(bool),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Equals { fact: String, value: String },
    NotEquals { fact: String, value: String },
    Matches { fact: String, pattern: Regex },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Condition, String> {
        let mut terms = vec![self.term()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.term()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::Any(terms)
        })
    }

    fn term(&mut self) -> Result<Condition, String> {
        let mut factors = vec![self.factor()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            factors.push(self.factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.remove(0)
        } else {
            Condition::All(factors)
        })
    }

    fn factor(&mut self) -> Result<Condition, String> {
        match self.next() {
            Some(Token::Not) => Ok(Condition::Not(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(name)) if name == "true" => Ok(Condition::Literal(true)),
            Some(Token::Ident(name)) if name == "false" => Ok(Condition::Literal(false)),
            Some(Token::Ident(fact)) => {
                let op = self.next();
                let value = match self.next() {
                    Some(Token::Str(value)) => value,
                    _ => return Err(format!("expected string after comparison on '{fact}'")),
                };
                match op {
                    Some(Token::Eq) => Ok(Condition::Equals { fact, value }),
                    Some(Token::Ne) => Ok(Condition::NotEquals { fact, value }),
                    Some(Token::Match) => {
                        let pattern = Regex::new(&value)
                            .map_err(|e| format!("invalid pattern for '{fact}': {e}"))?;
                        Ok(Condition::Matches { fact, pattern })
                    }
                    _ => Err(format!("expected ==, != or =~ after '{fact}'")),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

impl Condition {
    pub fn parse(input: &str) -> Result<Condition, String> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err("empty condition".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(format!("trailing input at {extra:?}"));
        }
        Ok(condition)
    }

    pub fn evaluate(&self, facts: &HostFacts) -> bool {
        fn fact<'a>(facts: &'a HostFacts, name: &str) -> &'a str {
            facts.get(name).map(String::as_str).unwrap_or("")
        }
        match self {
            Condition::Literal(value) => *value,
            Condition::Not(inner) => !inner.evaluate(facts),
            Condition::All(parts) => parts.iter().all(|c| c.evaluate(facts)),
            Condition::Any(parts) => parts.iter().any(|c| c.evaluate(facts)),
            Condition::Equals { fact: name, value } => fact(facts, name) == value.as_str(),
            Condition::NotEquals { fact: name, value } => fact(facts, name) != value.as_str(),
            Condition::Matches { fact: name, pattern } => pattern.is_match(fact(facts, name)),
        }
    }
}
