//! Cypher lexing and the read-only check applied to generated queries.
//!
//! The lexer is a chumsky parser that also enforces balanced brackets and
//! terminated strings. `validate` then works clause by clause over the
//! tokens: it is shallow, not a full grammar. The primitives at the top are
//! shared with the in-memory store's query parser.

use chumsky::extra;
use chumsky::prelude::*;
use thiserror::Error;

/// Extra type for parsers - uses Rich errors for better messages
pub type Extra<'src> = extra::Err<Rich<'src, char>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier or keyword. `quoted` is set for backtick identifiers, which
    /// are never treated as keywords.
    Ident { name: String, quoted: bool },
    Str(String),
    Number(f64),
    Param(String),
    Symbol(&'static str),
}

impl Token {
    /// Case-insensitive keyword test; quoted identifiers never match.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident { name, quoted: false } if name.eq_ignore_ascii_case(keyword))
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self, Token::Symbol(s) if *s == symbol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (at byte {position})")]
pub struct SyntaxError {
    pub message: String,
    pub position: usize,
}

impl SyntaxError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    fn from_rich(errs: &[Rich<'_, char>], input: &str) -> Self {
        let position = errs.first().map(|e| e.span().start).unwrap_or(0);
        Self::new(format_errors(errs, input), position)
    }
}

/// Brackets are lexed as groups, so they are not in this list.
const SYMBOLS: [&str; 21] = [
    "<>", "<=", ">=", "=~", "->", "<-", "..", ",", ":", ".", "=", "<", ">", "-", "+", "*", "/",
    "%", "^", "|", ";",
];

const READ_CLAUSES: &[&str] = &["MATCH", "OPTIONAL", "WITH", "UNWIND", "CALL", "RETURN"];

const CLAUSE_KEYWORDS: &[&str] = &[
    "MATCH", "OPTIONAL", "WITH", "UNWIND", "RETURN", "WHERE", "ORDER", "SKIP", "LIMIT",
];

const WRITE_CLAUSES: &[&str] = &[
    "CREATE", "MERGE", "DELETE", "DETACH", "SET", "REMOVE", "DROP", "LOAD", "FOREACH",
];

// ============================================================================
// Shared primitives
// ============================================================================

/// Identifier: a letter or underscore, then letters, digits and underscores.
pub fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_alphabetic() || *c == '_')
        .then(
            any()
                .filter(|c: &char| c.is_alphanumeric() || *c == '_')
                .repeated(),
        )
        .to_slice()
        .map(|s: &str| s.to_string())
        .labelled("identifier")
}

fn quoted_body<'src>(quote: char) -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    let escape = just('\\').ignore_then(any().map(|c| match c {
        'n' => '\n',
        't' => '\t',
        other => other,
    }));
    let plain = any().filter(move |c: &char| *c != quote && *c != '\\');

    just(quote)
        .ignore_then(plain.or(escape).repeated().collect::<String>())
        .then_ignore(just(quote).labelled("closing quote"))
}

/// Single- or double-quoted string with backslash escapes.
pub fn string_literal<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> + Clone {
    quoted_body('\'')
        .or(quoted_body('"'))
        .labelled("string literal")
}

/// One or more ASCII digits, as a slice.
pub fn digits<'src>() -> impl Parser<'src, &'src str, &'src str, Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .to_slice()
}

/// Unsigned decimal number. A dot only starts a fraction when a digit
/// follows it, so `1..3` stays a range.
pub fn number<'src>() -> impl Parser<'src, &'src str, f64, Extra<'src>> + Clone {
    digits()
        .then(just('.').then(digits()).or_not())
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<f64>()
                .map_err(|_| Rich::custom(span, "malformed number"))
        })
        .labelled("number")
}

/// Case-insensitive keyword matcher
pub fn kw<'src>(keyword: &'static str) -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_alphabetic())
        .repeated()
        .at_least(1)
        .to_slice()
        .try_map(move |s: &str, span| {
            if s.eq_ignore_ascii_case(keyword) {
                Ok(())
            } else {
                Err(Rich::custom(span, format!("expected keyword '{keyword}'")))
            }
        })
        .padded()
}

/// Format chumsky errors for human/LLM consumption
pub fn format_errors(errs: &[Rich<'_, char>], input: &str) -> String {
    errs.iter()
        .map(|e| {
            let start = e.span().start.min(input.len());
            let before = input.get(..start).unwrap_or(input);
            let line = before.lines().count().max(1);
            let col = start - before.rfind('\n').map_or(0, |i| i + 1);
            let found = e
                .found()
                .map_or("end of input".to_string(), |c| format!("'{c}'"));
            format!("Line {line}, column {}: {} (found {found})", col + 1, e.reason())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Lexer
// ============================================================================

fn atom<'src>() -> impl Parser<'src, &'src str, Token, Extra<'src>> + Clone {
    let quoted_ident = just('`')
        .ignore_then(none_of("`").repeated().to_slice())
        .then_ignore(just('`').labelled("closing backtick"))
        .map(|s: &str| Token::Ident {
            name: s.to_string(),
            quoted: true,
        });
    let param = just('$')
        .ignore_then(ident())
        .map(Token::Param)
        .labelled("parameter");
    let word = ident().map(|name| Token::Ident {
        name,
        quoted: false,
    });
    let symbol = choice(SYMBOLS.map(|s| just(s).to(s))).map(Token::Symbol);

    choice((
        string_literal().map(Token::Str),
        quoted_ident,
        param,
        number().map(Token::Number),
        word,
        symbol,
    ))
}

/// Tokens in source order. Bracket groups nest recursively, so an unclosed
/// or stray bracket fails the parse.
fn token_stream<'src>() -> impl Parser<'src, &'src str, Vec<Spanned>, Extra<'src>> {
    recursive(|stream| {
        let bracket = |symbol: &'static str| {
            just(symbol).to(symbol).map_with(|s, e: &mut chumsky::input::MapExtra<'src, '_, &'src str, Extra<'src>>| Spanned {
                token: Token::Symbol(s),
                position: e.span().start,
            })
        };
        let group = |open: &'static str, close: &'static str| {
            bracket(open)
                .then(stream.clone())
                .then(bracket(close).labelled(close))
                .map(|((open, inner), close): ((Spanned, Vec<Spanned>), Spanned)| {
                    let mut tokens = Vec::with_capacity(inner.len() + 2);
                    tokens.push(open);
                    tokens.extend(inner);
                    tokens.push(close);
                    tokens
                })
        };
        let single = atom().map_with(|token, e| {
            vec![Spanned {
                token,
                position: e.span().start,
            }]
        });
        let comment = just("//")
            .then(none_of("\n").repeated())
            .to(Vec::new());

        text::whitespace().ignore_then(
            choice((group("(", ")"), group("[", "]"), group("{", "}"), comment, single))
                .padded()
                .repeated()
                .collect::<Vec<Vec<Spanned>>>()
                .map(|groups| groups.into_iter().flatten().collect()),
        )
    })
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, SyntaxError> {
    token_stream()
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|errs| SyntaxError::from_rich(&errs, input))
}

// ============================================================================
// Clause checks
// ============================================================================

/// Property access or map key, not a clause.
fn is_name_position(tokens: &[Spanned], idx: usize) -> bool {
    let after_dot = idx > 0 && tokens[idx - 1].token.is_symbol(".");
    let before_colon = tokens.get(idx + 1).is_some_and(|t| t.token.is_symbol(":"));
    after_dot || before_colon
}

fn find_write_clause(tokens: &[Spanned]) -> Option<SyntaxError> {
    tokens.iter().enumerate().find_map(|(idx, spanned)| {
        if is_name_position(tokens, idx) {
            return None;
        }
        WRITE_CLAUSES
            .iter()
            .find(|k| spanned.token.is_keyword(k))
            .map(|keyword| {
                SyntaxError::new(
                    format!("write clause {keyword} is not allowed in a read query"),
                    spanned.position,
                )
            })
    })
}

/// Reject any query that would modify the graph, whatever else is wrong
/// with it. Text that does not lex is rejected too.
pub fn ensure_read_only(query: &str) -> Result<(), SyntaxError> {
    let tokens = tokenize(query)?;
    match find_write_clause(&tokens) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Syntax check for a single read-only query.
pub fn validate(query: &str) -> Result<(), SyntaxError> {
    let mut tokens = tokenize(query)?;

    if tokens.last().is_some_and(|t| t.token.is_symbol(";")) {
        tokens.pop();
    }
    let first = tokens
        .first()
        .ok_or_else(|| SyntaxError::new("query is empty", 0))?;

    if !READ_CLAUSES.iter().any(|k| first.token.is_keyword(k)) {
        return Err(SyntaxError::new(
            "query must start with MATCH, OPTIONAL MATCH, WITH, UNWIND, CALL or RETURN",
            first.position,
        ));
    }
    if let Some(err) = find_write_clause(&tokens) {
        return Err(err);
    }

    let mut has_return = false;
    for (idx, spanned) in tokens.iter().enumerate() {
        if is_name_position(&tokens, idx) {
            continue;
        }
        if spanned.token.is_symbol(";") {
            return Err(SyntaxError::new("only one statement is allowed", spanned.position));
        }
        if spanned.token.is_keyword("CALL") {
            let is_db_procedure = tokens.get(idx + 1).is_some_and(|t| t.token.is_keyword("db"))
                && tokens.get(idx + 2).is_some_and(|t| t.token.is_symbol("."));
            if !is_db_procedure {
                return Err(SyntaxError::new(
                    "only db.* procedures may be called",
                    spanned.position,
                ));
            }
        }
        let expects_operand = ["WHERE", "AND", "OR", "XOR", "NOT"]
            .iter()
            .any(|k| spanned.token.is_keyword(k))
            || matches!(spanned.token, Token::Symbol(s) if matches!(s, "=" | "<>" | "<" | ">" | "<=" | ">=" | "," | "+"));
        if expects_operand {
            if let Some(next) = tokens.get(idx + 1) {
                if let Some(clause) = CLAUSE_KEYWORDS.iter().find(|k| next.token.is_keyword(k)) {
                    return Err(SyntaxError::new(
                        format!("expected an expression before {clause}"),
                        next.position,
                    ));
                }
            }
        }
        if spanned.token.is_keyword("RETURN") {
            has_return = true;
            if idx + 1 == tokens.len() {
                return Err(SyntaxError::new("RETURN has no projection", spanned.position));
            }
        }
    }

    let ends_with_call = tokens
        .iter()
        .rev()
        .take(6)
        .any(|t| t.token.is_keyword("YIELD") || t.token.is_keyword("CALL"));
    if !has_return && !ends_with_call {
        return Err(SyntaxError::new("query has no RETURN clause", query.len()));
    }

    if let Some(last) = tokens.last() {
        let dangling = matches!(
            last.token,
            Token::Symbol(s) if !matches!(s, ")" | "]" | "}" | "*")
        ) || ["WHERE", "AND", "OR", "NOT", "RETURN", "MATCH", "WITH", "BY", "LIMIT", "SKIP"]
            .iter()
            .any(|k| last.token.is_keyword(k));
        if dangling {
            return Err(SyntaxError::new("query ends unexpectedly", last.position));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_patterns_and_literals() {
        let tokens = tokenize("MATCH (a:Person {name: 'O\\'Neil'})-[:KNOWS]->(b) RETURN b.name LIMIT 5")
            .unwrap();
        assert!(tokens[0].token.is_keyword("match"));
        assert_eq!(tokens[0].position, 0);
        assert!(tokens[1].token.is_symbol("("));
        assert_eq!(tokens[1].position, 6);
        assert!(tokens.iter().any(|t| t.token == Token::Str("O'Neil".into())));
        assert!(tokens.iter().any(|t| t.token.is_symbol("->")));
        assert!(tokens.iter().any(|t| t.token == Token::Number(5.0)));
    }

    #[test]
    fn ranges_are_not_fractions() {
        let tokens = tokenize("[*1..3]").unwrap();
        assert_eq!(tokens[2].token, Token::Number(1.0));
        assert!(tokens[3].token.is_symbol(".."));
        assert_eq!(tokens[4].token, Token::Number(3.0));
        assert_eq!(tokenize("2.5").unwrap()[0].token, Token::Number(2.5));
    }

    #[test]
    fn comments_and_quoted_names() {
        let tokens = tokenize("MATCH (n) // every node\nRETURN n.`set`").unwrap();
        assert_eq!(tokens.len(), 8);
        assert_eq!(
            tokens[7].token,
            Token::Ident {
                name: "set".into(),
                quoted: true
            }
        );
        assert!(!tokens[7].token.is_keyword("set"));
    }

    #[test]
    fn lexer_reports_unbalanced_and_unterminated_input() {
        for q in [
            "MATCH (n RETURN n",
            "MATCH (n)) RETURN n",
            "MATCH (n] RETURN n",
            "MATCH (n) WHERE n.name = 'abc RETURN n",
            "MATCH (n) RETURN n.`x",
            "MATCH (n) RETURN $",
            "MATCH (n) RETURN n # 1",
        ] {
            let err = tokenize(q).unwrap_err();
            assert!(err.message.starts_with("Line 1, column"), "{q}: {}", err.message);
        }
    }

    #[test]
    fn accepts_common_read_queries() {
        for q in [
            "MATCH (p:Person)-[:FOUNDED]->(o:Organization) RETURN p.name, o.name LIMIT 10",
            "MATCH (n:__Entity__) WHERE toLower(n.name) CONTAINS 'acme' RETURN n;",
            "OPTIONAL MATCH (n) RETURN count(n) AS total",
            "CALL db.labels()",
            "MATCH (n) WHERE n.`set` = 1 RETURN n {.name, set: 1}",
            "MATCH (a)-[r*1..2]-(b) RETURN type(r[0]) AS t",
            "  MATCH (n)\n  RETURN n  ",
        ] {
            assert!(validate(q).is_ok(), "expected valid: {q}: {:?}", validate(q));
        }
    }

    #[test]
    fn rejects_broken_queries() {
        let cases = [
            ("", "empty"),
            ("Here is the query: MATCH (n) RETURN n", "must start"),
            ("MATCH (n)", "no RETURN"),
            ("MATCH (n) RETURN", "no projection"),
            ("MATCH (n) WHERE n.x = 1 AND RETURN n", "expected an expression"),
            ("MATCH (n) DETACH DELETE n RETURN 1", "write clause"),
            ("MATCH (n) SET n.x = 1 RETURN n", "write clause"),
            ("MATCH (n) RETURN n; MATCH (m) RETURN m", "one statement"),
            ("CALL apoc.do.it() RETURN 1", "db.*"),
            ("MATCH (n) RETURN n.", "ends unexpectedly"),
        ];
        for (q, fragment) in cases {
            match validate(q) {
                Ok(()) => panic!("expected invalid: {q}"),
                Err(e) => assert!(e.message.contains(fragment), "{q}: {}", e.message),
            }
        }
        assert!(validate("MATCH (n RETURN n").is_err());
        assert!(validate("MATCH (n) WHERE n.name = 'abc RETURN n").is_err());
    }

    #[test]
    fn read_only_check_ignores_other_syntax_problems() {
        assert!(ensure_read_only("MATCH (n) RETURN n").is_ok());
        assert!(ensure_read_only("RETURN 1 +").is_ok());
        assert!(ensure_read_only("MATCH (n {set: 1}) RETURN n.delete").is_ok());

        let err = ensure_read_only("MATCH (n) DETACH DELETE n").unwrap_err();
        assert!(err.message.contains("DETACH"));
        assert!(ensure_read_only("create (n:Person)").is_err());
        assert!(ensure_read_only("MATCH (n) SET n.x = 'unterminated").is_err());
    }

    #[test]
    fn primitives_parse_on_their_own() {
        assert_eq!(ident().parse("foo_bar1").into_result().unwrap(), "foo_bar1");
        assert!(ident().parse("1foo").into_result().is_err());
        assert_eq!(string_literal().parse("\"a\\tb\"").into_result().unwrap(), "a\tb");
        assert!(kw("match").parse("MATCH").into_result().is_ok());
        assert!(kw("match").parse("matches").into_result().is_err());
    }
}
