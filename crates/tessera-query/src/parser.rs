use tantivy::Index;
use tantivy::query::{AllQuery, BooleanQuery, BoostQuery, EmptyQuery, Occur, PhraseQuery, Query, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Term, tokenizer::TextAnalyzer};
use tessera_core::error::{QueryError, StateError};
use tessera_state::lexical_index::LexicalFields;

pub use tessera_core::language::detect_language;

/// Query-time field boosts realizing the symbolic lexical weights:
/// title carries weight A, content weight B.
pub const TITLE_BOOST: f32 = 2.0;
pub const CONTENT_BOOST: f32 = 1.0;

/// How a query was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Plain,
    Phrase,
    Advanced,
}

/// One token of an advanced query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryToken {
    Text(String),
    Phrase(String),
    And,
    Or,
    Not,
    GroupOpen,
    GroupClose,
}

/// Structured form of a parsed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub query_type: QueryType,
    pub tokens: Vec<QueryToken>,
    pub phrases: Vec<String>,
}

/// Store-native lexical expression tree. `Display` renders the exact wire
/// form, with single quotes doubled inside literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexicalExpr {
    Plain { config: String, text: String },
    Phrase { config: String, text: String },
    And(Vec<LexicalExpr>),
    Or(Vec<LexicalExpr>),
    Not(Box<LexicalExpr>),
}

/// Validate and classify a query.
pub fn parse(query: &str, min_len: usize, max_len: usize) -> Result<ParsedQuery, QueryError> {
    let trimmed = query.trim();
    let length = trimmed.chars().count();
    if length == 0 {
        return Err(QueryError::validation("query must not be blank"));
    }
    if length < min_len {
        return Err(QueryError::validation(format!(
            "query must be at least {min_len} characters"
        )));
    }
    if length > max_len {
        return Err(QueryError::validation(format!(
            "query must be at most {max_len} characters"
        )));
    }

    // A query that is exactly one quoted string is a phrase query.
    if trimmed.len() >= 2
        && trimmed.starts_with('"')
        && trimmed.ends_with('"')
        && !trimmed[1..trimmed.len() - 1].contains('"')
    {
        let inner = trimmed[1..trimmed.len() - 1].trim().to_string();
        if inner.is_empty() {
            return Err(QueryError::validation("phrase query must not be empty"));
        }
        return Ok(ParsedQuery {
            query_type: QueryType::Phrase,
            tokens: vec![QueryToken::Phrase(inner.clone())],
            phrases: vec![inner],
        });
    }

    let tokens = tokenize(trimmed)?;
    let advanced = tokens.iter().any(|token| {
        matches!(
            token,
            QueryToken::And | QueryToken::Or | QueryToken::Not | QueryToken::Phrase(_)
        )
    });

    if advanced {
        let phrases = tokens
            .iter()
            .filter_map(|token| match token {
                QueryToken::Phrase(text) => Some(text.clone()),
                _ => None,
            })
            .collect();
        Ok(ParsedQuery {
            query_type: QueryType::Advanced,
            tokens,
            phrases,
        })
    } else {
        Ok(ParsedQuery {
            query_type: QueryType::Plain,
            tokens: vec![QueryToken::Text(trimmed.to_string())],
            phrases: Vec::new(),
        })
    }
}

/// Scan a query into tokens: quoted phrases, parentheses, the AND/OR/NOT
/// keywords (case-insensitive), and merged text runs.
fn tokenize(query: &str) -> Result<Vec<QueryToken>, QueryError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut depth = 0i32;
    let mut chars = query.chars().peekable();

    let flush = |word: &mut String, tokens: &mut Vec<QueryToken>| {
        if word.is_empty() {
            return;
        }
        let token = match word.to_ascii_uppercase().as_str() {
            "AND" => QueryToken::And,
            "OR" => QueryToken::Or,
            "NOT" => QueryToken::Not,
            _ => {
                // Adjacent text words merge into one run.
                if let Some(QueryToken::Text(run)) = tokens.last_mut() {
                    run.push(' ');
                    run.push_str(word.as_str());
                    word.clear();
                    return;
                }
                QueryToken::Text(std::mem::take(word))
            }
        };
        word.clear();
        tokens.push(token);
    };

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                flush(&mut word, &mut tokens);
                let mut phrase = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '"' {
                        closed = true;
                        break;
                    }
                    phrase.push(inner);
                }
                if !closed {
                    return Err(QueryError::parse("unterminated quote in query"));
                }
                let phrase = phrase.trim().to_string();
                if !phrase.is_empty() {
                    tokens.push(QueryToken::Phrase(phrase));
                }
            }
            '(' => {
                flush(&mut word, &mut tokens);
                depth += 1;
                tokens.push(QueryToken::GroupOpen);
            }
            ')' => {
                flush(&mut word, &mut tokens);
                depth -= 1;
                if depth < 0 {
                    return Err(QueryError::parse("unbalanced parentheses in query"));
                }
                tokens.push(QueryToken::GroupClose);
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);

    if depth != 0 {
        return Err(QueryError::parse("unbalanced parentheses in query"));
    }
    Ok(tokens)
}

/// Build the store-native expression for a parsed query under a tokenizer
/// configuration. Deterministic: the same parse always emits the same tree.
pub fn emit(parsed: &ParsedQuery, config: &str) -> Result<LexicalExpr, QueryError> {
    match parsed.query_type {
        QueryType::Plain => {
            let text = parsed
                .tokens
                .iter()
                .find_map(|token| match token {
                    QueryToken::Text(text) => Some(text.clone()),
                    _ => None,
                })
                .ok_or_else(|| QueryError::parse("plain query has no text"))?;
            Ok(LexicalExpr::Plain {
                config: config.to_string(),
                text,
            })
        }
        QueryType::Phrase => {
            let text = parsed.phrases.first().cloned().unwrap_or_default();
            Ok(LexicalExpr::Phrase {
                config: config.to_string(),
                text,
            })
        }
        QueryType::Advanced => {
            let mut cursor = Cursor {
                tokens: &parsed.tokens,
                position: 0,
                config,
            };
            let expr = cursor.or_expr()?;
            if cursor.position != parsed.tokens.len() {
                return Err(QueryError::parse("trailing tokens in query"));
            }
            Ok(expr)
        }
    }
}

/// Recursive-descent parser over the token list.
/// Precedence, loosest first: OR, then (implicit) AND, then NOT.
struct Cursor<'a> {
    tokens: &'a [QueryToken],
    position: usize,
    config: &'a str,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<&QueryToken> {
        self.tokens.get(self.position)
    }

    fn bump(&mut self) -> Option<&QueryToken> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<LexicalExpr, QueryError> {
        let mut operands = vec![self.and_expr()?];
        while matches!(self.peek(), Some(QueryToken::Or)) {
            self.bump();
            operands.push(self.and_expr()?);
        }
        if operands.len() == 1 {
            Ok(operands.remove(0))
        } else {
            Ok(LexicalExpr::Or(operands))
        }
    }

    fn and_expr(&mut self) -> Result<LexicalExpr, QueryError> {
        let mut operands = vec![self.unary()?];
        loop {
            match self.peek() {
                Some(QueryToken::And) => {
                    self.bump();
                    operands.push(self.unary()?);
                }
                // Adjacency is an implicit AND.
                Some(QueryToken::Not | QueryToken::Text(_) | QueryToken::Phrase(_))
                | Some(QueryToken::GroupOpen) => {
                    operands.push(self.unary()?);
                }
                _ => break,
            }
        }
        if operands.len() == 1 {
            Ok(operands.remove(0))
        } else {
            Ok(LexicalExpr::And(operands))
        }
    }

    fn unary(&mut self) -> Result<LexicalExpr, QueryError> {
        if matches!(self.peek(), Some(QueryToken::Not)) {
            self.bump();
            return Ok(LexicalExpr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<LexicalExpr, QueryError> {
        match self.bump() {
            Some(QueryToken::Text(text)) => Ok(LexicalExpr::Plain {
                config: self.config.to_string(),
                text: text.clone(),
            }),
            Some(QueryToken::Phrase(text)) => Ok(LexicalExpr::Phrase {
                config: self.config.to_string(),
                text: text.clone(),
            }),
            Some(QueryToken::GroupOpen) => {
                let inner = self.or_expr()?;
                match self.bump() {
                    Some(QueryToken::GroupClose) => Ok(inner),
                    _ => Err(QueryError::parse("expected closing parenthesis")),
                }
            }
            other => Err(QueryError::parse(format!(
                "unexpected token in query: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for LexicalExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain { config, text } => {
                write!(f, "plain_query({config},'{}')", escape_literal(text))
            }
            Self::Phrase { config, text } => {
                write!(f, "phrase_query({config},'{}')", escape_literal(text))
            }
            Self::And(operands) => {
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " && ")?;
                    }
                    write_operand(f, operand, true)?;
                }
                Ok(())
            }
            Self::Or(operands) => {
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " || ")?;
                    }
                    write_operand(f, operand, false)?;
                }
                Ok(())
            }
            Self::Not(inner) => {
                write!(f, "!! ")?;
                write_operand(f, inner, true)
            }
        }
    }
}

/// Parenthesize an OR under an AND (or NOT) so the rendered precedence is
/// unambiguous; everything else renders bare.
fn write_operand(
    f: &mut std::fmt::Formatter<'_>,
    operand: &LexicalExpr,
    parenthesize_or: bool,
) -> std::fmt::Result {
    match operand {
        LexicalExpr::Or(_) if parenthesize_or => write!(f, "({operand})"),
        LexicalExpr::And(_) => write!(f, "({operand})"),
        _ => write!(f, "{operand}"),
    }
}

fn escape_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// Compile an expression into a tantivy query over the title and content
/// fields, analyzing literals with the index's named tokenizer.
pub fn compile(
    expr: &LexicalExpr,
    index: &Index,
    fields: &LexicalFields,
) -> Result<Box<dyn Query>, StateError> {
    match expr {
        LexicalExpr::Plain { config, text } => {
            let tokens = analyze(index, config, text)?;
            if tokens.is_empty() {
                return Ok(Box::new(EmptyQuery));
            }
            // Natural-language match: every token required, matched in
            // either field with the title boosted.
            let clauses: Vec<(Occur, Box<dyn Query>)> = tokens
                .iter()
                .map(|token| {
                    (
                        Occur::Must,
                        Box::new(either_field_query(fields, token)) as Box<dyn Query>,
                    )
                })
                .collect();
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
        LexicalExpr::Phrase { config, text } => {
            let tokens = analyze(index, config, text)?;
            match tokens.len() {
                0 => Ok(Box::new(EmptyQuery)),
                1 => Ok(Box::new(either_field_query(fields, &tokens[0]))),
                _ => {
                    let title_terms: Vec<Term> = tokens
                        .iter()
                        .map(|token| Term::from_field_text(fields.title, token))
                        .collect();
                    let content_terms: Vec<Term> = tokens
                        .iter()
                        .map(|token| Term::from_field_text(fields.content, token))
                        .collect();
                    let clauses: Vec<(Occur, Box<dyn Query>)> = vec![
                        (
                            Occur::Should,
                            Box::new(BoostQuery::new(
                                Box::new(PhraseQuery::new(title_terms)),
                                TITLE_BOOST,
                            )),
                        ),
                        (Occur::Should, Box::new(PhraseQuery::new(content_terms))),
                    ];
                    Ok(Box::new(BooleanQuery::new(clauses)))
                }
            }
        }
        LexicalExpr::And(operands) => {
            let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            let mut has_positive = false;
            for operand in operands {
                match operand {
                    LexicalExpr::Not(inner) => {
                        clauses.push((Occur::MustNot, compile(inner, index, fields)?));
                    }
                    _ => {
                        has_positive = true;
                        clauses.push((Occur::Must, compile(operand, index, fields)?));
                    }
                }
            }
            if !has_positive {
                clauses.push((Occur::Must, Box::new(AllQuery)));
            }
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
        LexicalExpr::Or(operands) => {
            let clauses: Vec<(Occur, Box<dyn Query>)> = operands
                .iter()
                .map(|operand| {
                    compile(operand, index, fields).map(|query| (Occur::Should, query))
                })
                .collect::<Result<_, _>>()?;
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
        LexicalExpr::Not(inner) => Ok(Box::new(BooleanQuery::new(vec![
            (Occur::Must, Box::new(AllQuery) as Box<dyn Query>),
            (Occur::MustNot, compile(inner, index, fields)?),
        ]))),
    }
}

/// Match one analyzed token in title (boosted) or content.
fn either_field_query(fields: &LexicalFields, token: &str) -> BooleanQuery {
    BooleanQuery::new(vec![
        (
            Occur::Should,
            Box::new(BoostQuery::new(
                Box::new(TermQuery::new(
                    Term::from_field_text(fields.title, token),
                    IndexRecordOption::WithFreqsAndPositions,
                )),
                TITLE_BOOST,
            )) as Box<dyn Query>,
        ),
        (
            Occur::Should,
            Box::new(BoostQuery::new(
                Box::new(TermQuery::new(
                    Term::from_field_text(fields.content, token),
                    IndexRecordOption::WithFreqsAndPositions,
                )),
                CONTENT_BOOST,
            )),
        ),
    ])
}

/// Run a literal through the index's named analyzer.
fn analyze(index: &Index, config: &str, text: &str) -> Result<Vec<String>, StateError> {
    let mut analyzer: TextAnalyzer = index
        .tokenizers()
        .get(config)
        .ok_or_else(|| StateError::Fulltext(format!("tokenizer config not registered: {config}")))?;
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    Ok(tokens)
}
