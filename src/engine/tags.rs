//! Tag filter expressions.
//!
//! Grammar, loosest to tightest binding: `a || b`, `a && b`, `~@tag`,
//! `@tag`, and parenthesised groups. An empty expression selects
//! everything. Tags are matched against the union of feature-level and
//! scenario-level tags, with or without their leading `@`.

use crate::error::ConfigError;

/// A parsed tag filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpression {
    /// Matches everything.
    All,
    /// The tag must be present.
    Tag(String),
    /// Negation.
    Not(Box<TagExpression>),
    /// Both sides must hold.
    And(Box<TagExpression>, Box<TagExpression>),
    /// Either side must hold.
    Or(Box<TagExpression>, Box<TagExpression>),
}

impl TagExpression {
    /// Parse a filter expression.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` on malformed expressions.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::All);
        }
        let tokens = tokenize(trimmed)?;
        let mut parser = Parser {
            tokens: &tokens,
            position: 0,
        };
        let expression = parser.parse_or()?;
        if parser.position != tokens.len() {
            return Err(invalid(input, "unexpected trailing tokens"));
        }
        Ok(expression)
    }

    /// Whether a scenario with these tags is selected.
    #[must_use]
    pub fn matches(&self, tags: &[String]) -> bool {
        match self {
            Self::All => true,
            Self::Tag(wanted) => tags.iter().any(|tag| {
                tag.trim_start_matches('@') == wanted.trim_start_matches('@')
            }),
            Self::Not(inner) => !inner.matches(tags),
            Self::And(left, right) => left.matches(tags) && right.matches(tags),
            Self::Or(left, right) => left.matches(tags) || right.matches(tags),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Tag(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '~' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(invalid(input, "expected '&&'"));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(invalid(input, "expected '||'"));
                }
                tokens.push(Token::Or);
            }
            '@' => {
                chars.next();
                let mut tag = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        tag.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if tag.is_empty() {
                    return Err(invalid(input, "empty tag after '@'"));
                }
                tokens.push(Token::Tag(tag));
            }
            other => {
                return Err(invalid(input, &format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn parse_or(&mut self) -> Result<TagExpression, ConfigError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.position += 1;
            let right = self.parse_and()?;
            left = TagExpression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<TagExpression, ConfigError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.position += 1;
            let right = self.parse_unary()?;
            left = TagExpression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<TagExpression, ConfigError> {
        match self.peek() {
            Some(Token::Not) => {
                self.position += 1;
                Ok(TagExpression::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Open) => {
                self.position += 1;
                let inner = self.parse_or()?;
                if !matches!(self.peek(), Some(Token::Close)) {
                    return Err(invalid("", "missing closing parenthesis"));
                }
                self.position += 1;
                Ok(inner)
            }
            Some(Token::Tag(tag)) => {
                let tag = tag.clone();
                self.position += 1;
                Ok(TagExpression::Tag(tag))
            }
            _ => Err(invalid("", "expected a tag")),
        }
    }
}

fn invalid(input: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: String::from("features.tags"),
        reason: if input.is_empty() {
            String::from(reason)
        } else {
            format!("{reason} in \"{input}\"")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| String::from(*name)).collect()
    }

    #[rstest]
    fn empty_expression_selects_everything() {
        let expression = TagExpression::parse("").expect("empty parses");
        assert!(expression.matches(&tags(&[])));
        assert!(expression.matches(&tags(&["smoke"])));
    }

    #[rstest]
    #[case("@smoke", &["smoke"], true)]
    #[case("@smoke", &["slow"], false)]
    #[case("@smoke", &[], false)]
    #[case("~@slow", &["smoke"], true)]
    #[case("~@slow", &["slow"], false)]
    #[case("@smoke && @fast", &["smoke", "fast"], true)]
    #[case("@smoke && @fast", &["smoke"], false)]
    #[case("@smoke || @fast", &["fast"], true)]
    #[case("@smoke || @fast", &["slow"], false)]
    #[case("@smoke && ~@slow", &["smoke"], true)]
    #[case("@smoke && ~@slow", &["smoke", "slow"], false)]
    fn expressions_evaluate_against_tag_sets(
        #[case] expression: &str,
        #[case] present: &[&str],
        #[case] selected: bool,
    ) {
        let parsed = TagExpression::parse(expression).expect("expression parses");
        assert_eq!(parsed.matches(&tags(present)), selected);
    }

    #[rstest]
    fn and_binds_tighter_than_or() {
        // a || b && c parses as a || (b && c).
        let parsed = TagExpression::parse("@a || @b && @c").expect("parses");
        assert!(parsed.matches(&tags(&["a"])));
        assert!(parsed.matches(&tags(&["b", "c"])));
        assert!(!parsed.matches(&tags(&["b"])));
    }

    #[rstest]
    fn parentheses_override_precedence() {
        let parsed = TagExpression::parse("(@a || @b) && @c").expect("parses");
        assert!(parsed.matches(&tags(&["a", "c"])));
        assert!(!parsed.matches(&tags(&["a"])));
    }

    #[rstest]
    fn tags_match_with_or_without_the_at_prefix() {
        let parsed = TagExpression::parse("@smoke").expect("parses");
        assert!(parsed.matches(&tags(&["@smoke"])));
        assert!(parsed.matches(&tags(&["smoke"])));
    }

    #[rstest]
    #[case("@")]
    #[case("&& @a")]
    #[case("@a &&")]
    #[case("@a & @b")]
    #[case("(@a")]
    #[case("@a @b")]
    fn malformed_expressions_are_rejected(#[case] expression: &str) {
        assert!(TagExpression::parse(expression).is_err());
    }
}
