//! Surface syntax
//!
//! An input file interleaves line-level **directives** (first non-blank
//! character `#`) with s-expression **clauses**. `;` starts a comment that
//! runs to the end of the line. Directives take effect immediately; the
//! clauses accumulated between two directives form one batch.
//!
//! Clauses:
//!
//! ```text
//! (duck is-a bird)                                   ; fact (ground triple)
//! (prepare: (<s> is-a bird) -(<s> fly _) -> (<s> fly-prepare can))
//! ((<s> fly-prepare can) -> (<s> fly can))           ; auto-named production
//! ((<s> fly can) -> <s>)                             ; query
//! ```
//!
//! A production is a condition list, `->`, and an optional RHS pattern;
//! the leading `name:` is optional. A clause whose right-hand side is a
//! list of variables instead of a pattern is a query. Condition markers:
//! `-( … )` negative, `+( … )` existential. Fields are constants, `<var>`
//! variables, or the `_` wildcard.
//!
//! Malformed clauses are fatal ([`ParseError`]); malformed directives are
//! warned about and dropped, which is why [`parse_directive`] returns an
//! `Option` rather than an error.

#![forbid(unsafe_code)]

use tracing::warn;

use crate::fuzzy::{FuzzyKind, FuzzySystem, FuzzyValueDef};
use crate::matcher::{CondKind, Condition, Field, Pattern};
use crate::wme::{Interner, Sym};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: unexpected end of input")]
    UnexpectedEof { line: usize },
    #[error("line {line}: unexpected `{found}` ({expected})")]
    Unexpected { line: usize, found: String, expected: &'static str },
    #[error("line {line}: facts must be ground triples")]
    NonGroundFact { line: usize },
}

#[derive(Clone, Debug)]
pub enum Directive {
    Stratum,
    SchemaCheck(bool),
    Schema { id: Option<Sym>, attr: Sym, val: Option<Sym>, description: String },
    FuzzySystem(FuzzySystem),
    FuzzyKind(FuzzyKind),
    FuzzyVar { name: Sym, kind: Sym },
}

#[derive(Clone, Debug)]
pub enum Clause {
    Fact { id: Sym, attr: Sym, val: Sym },
    Production { name: Option<Sym>, lhs: Vec<Condition>, rhs: Option<Pattern> },
    Query { lhs: Vec<Condition>, vars: Vec<Sym> },
}

#[derive(Clone, Debug)]
pub enum Item {
    Directive(Directive),
    Clause(Clause),
}

/// Parse a whole source text into directives and clauses, in order.
pub fn parse_source(text: &str, syms: &mut Interner) -> Result<Vec<Item>, ParseError> {
    let mut items = Vec::new();
    let mut buf = String::new();
    let mut buf_start = 1usize;

    let flush = |items: &mut Vec<Item>, buf: &mut String, start: usize, syms: &mut Interner| {
        if buf.trim().is_empty() {
            buf.clear();
            return Ok(());
        }
        for clause in parse_clauses(buf, start, syms)? {
            items.push(Item::Clause(clause));
        }
        buf.clear();
        Ok(())
    };

    for (i, line) in text.lines().enumerate() {
        let lineno = i + 1;
        if let Some(rest) = line.trim_start().strip_prefix('#') {
            flush(&mut items, &mut buf, buf_start, syms)?;
            buf_start = lineno + 1;
            if let Some(d) = parse_directive(rest, syms) {
                items.push(Item::Directive(d));
            }
        } else {
            if buf.is_empty() {
                buf_start = lineno;
            }
            buf.push_str(line);
            buf.push('\n');
        }
    }
    flush(&mut items, &mut buf, buf_start, syms)?;
    Ok(items)
}

// ================================ lexer =================================

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    LParen,
    RParen,
    Neg,
    Pos,
    Arrow,
    Atom(String),
}

fn lex(text: &str, start_line: usize) -> Vec<(Tok, usize)> {
    let mut toks = Vec::new();
    let mut line = start_line;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            ';' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '(' => toks.push((Tok::LParen, line)),
            ')' => toks.push((Tok::RParen, line)),
            '-' | '+' if chars.peek() == Some(&'(') => {
                toks.push((if c == '-' { Tok::Neg } else { Tok::Pos }, line));
            }
            c if c.is_whitespace() => {}
            c => {
                let mut atom = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || n == '(' || n == ')' || n == ';' {
                        break;
                    }
                    atom.push(n);
                    chars.next();
                }
                toks.push((if atom == "->" { Tok::Arrow } else { Tok::Atom(atom) }, line));
            }
        }
    }
    toks
}

// ================================ parser ================================

struct Parser<'a> {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    syms: &'a mut Interner,
    last_line: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<Tok, ParseError> {
        match self.toks.get(self.pos) {
            Some((t, l)) => {
                self.pos += 1;
                self.last_line = *l;
                Ok(t.clone())
            }
            None => Err(ParseError::UnexpectedEof { line: self.last_line }),
        }
    }

    fn expect(&mut self, want: Tok, expected: &'static str) -> Result<(), ParseError> {
        let t = self.next()?;
        if t == want {
            Ok(())
        } else {
            Err(self.unexpected(&t, expected))
        }
    }

    fn unexpected(&self, t: &Tok, expected: &'static str) -> ParseError {
        let found = match t {
            Tok::LParen => "(".to_string(),
            Tok::RParen => ")".to_string(),
            Tok::Neg => "-(".to_string(),
            Tok::Pos => "+(".to_string(),
            Tok::Arrow => "->".to_string(),
            Tok::Atom(a) => a.clone(),
        };
        ParseError::Unexpected { line: self.last_line, found, expected }
    }

    fn field(&mut self, atom: &str) -> Field {
        if atom == "_" {
            Field::Wild
        } else if atom.starts_with('<') && atom.ends_with('>') && atom.len() > 2 {
            Field::Var(self.syms.get_or_intern(&atom[1..atom.len() - 1]))
        } else {
            Field::Const(self.syms.get_or_intern(atom))
        }
    }

    /// `f f f )`; the opening paren is already consumed.
    fn pattern_body(&mut self) -> Result<Pattern, ParseError> {
        let mut fields = Vec::with_capacity(3);
        loop {
            match self.next()? {
                Tok::RParen => break,
                Tok::Atom(a) => fields.push(self.field(&a)),
                t => return Err(self.unexpected(&t, "a pattern field")),
            }
        }
        let fields: [Field; 3] = fields
            .try_into()
            .map_err(|_| ParseError::Unexpected {
                line: self.last_line,
                found: ")".to_string(),
                expected: "exactly three pattern fields",
            })?;
        Ok(Pattern(fields))
    }

    fn conditions(&mut self) -> Result<Vec<Condition>, ParseError> {
        let mut conds = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::Arrow) => {
                    self.next()?;
                    return Ok(conds);
                }
                Some(Tok::LParen) | Some(Tok::Neg) | Some(Tok::Pos) => {
                    let kind = match self.next()? {
                        Tok::LParen => CondKind::Positive,
                        Tok::Neg => {
                            self.expect(Tok::LParen, "`(` after `-`")?;
                            CondKind::Negative
                        }
                        _ => {
                            self.expect(Tok::LParen, "`(` after `+`")?;
                            CondKind::Existential
                        }
                    };
                    conds.push(Condition { kind, pattern: self.pattern_body()? });
                }
                _ => {
                    let t = self.next()?;
                    return Err(self.unexpected(&t, "a condition or `->`"));
                }
            }
        }
    }

    /// Everything after the condition list's `->`, up to the closing paren.
    fn clause_tail(
        &mut self,
        name: Option<Sym>,
        lhs: Vec<Condition>,
    ) -> Result<Clause, ParseError> {
        match self.next()? {
            Tok::RParen => Ok(Clause::Production { name, lhs, rhs: None }),
            Tok::LParen => {
                let rhs = self.pattern_body()?;
                self.expect(Tok::RParen, "`)` closing the production")?;
                Ok(Clause::Production { name, lhs, rhs: Some(rhs) })
            }
            Tok::Atom(first) if first.starts_with('<') => {
                if name.is_some() {
                    warn!("query names are ignored");
                }
                let mut vars = vec![self.var_atom(&first)?];
                loop {
                    match self.next()? {
                        Tok::RParen => break,
                        Tok::Atom(a) if a.starts_with('<') => vars.push(self.var_atom(&a)?),
                        t => return Err(self.unexpected(&t, "a `<variable>` or `)`")),
                    }
                }
                Ok(Clause::Query { lhs, vars })
            }
            t => Err(self.unexpected(&t, "an RHS pattern, query variables, or `)`")),
        }
    }

    fn var_atom(&mut self, atom: &str) -> Result<Sym, ParseError> {
        match self.field(atom) {
            Field::Var(v) => Ok(v),
            _ => Err(ParseError::Unexpected {
                line: self.last_line,
                found: atom.to_string(),
                expected: "a `<variable>`",
            }),
        }
    }

    fn clause(&mut self) -> Result<Clause, ParseError> {
        self.expect(Tok::LParen, "`(` opening a clause")?;
        match self.next()? {
            Tok::Atom(a) if a.ends_with(':') && a.len() > 1 => {
                let name = self.syms.get_or_intern(&a[..a.len() - 1]);
                let lhs = self.conditions()?;
                self.clause_tail(Some(name), lhs)
            }
            Tok::Atom(first) => {
                // Ground triple.
                let mut atoms = vec![first];
                loop {
                    match self.next()? {
                        Tok::RParen => break,
                        Tok::Atom(a) => atoms.push(a),
                        t => return Err(self.unexpected(&t, "a fact field or `)`")),
                    }
                }
                if atoms.len() != 3
                    || atoms.iter().any(|a| a == "_" || a.starts_with('<'))
                {
                    return Err(ParseError::NonGroundFact { line: self.last_line });
                }
                Ok(Clause::Fact {
                    id: self.syms.get_or_intern(&atoms[0]),
                    attr: self.syms.get_or_intern(&atoms[1]),
                    val: self.syms.get_or_intern(&atoms[2]),
                })
            }
            Tok::LParen => {
                // Already inside the first condition.
                self.pos -= 1;
                let lhs = self.conditions()?;
                self.clause_tail(None, lhs)
            }
            Tok::Neg | Tok::Pos => {
                self.pos -= 1;
                let lhs = self.conditions()?;
                self.clause_tail(None, lhs)
            }
            t => Err(self.unexpected(&t, "a clause body")),
        }
    }
}

fn parse_clauses(
    text: &str,
    start_line: usize,
    syms: &mut Interner,
) -> Result<Vec<Clause>, ParseError> {
    let toks = lex(text, start_line);
    let mut p = Parser { toks, pos: 0, syms, last_line: start_line };
    let mut clauses = Vec::new();
    while p.peek().is_some() {
        clauses.push(p.clause()?);
    }
    Ok(clauses)
}

// ============================== directives ==============================

/// Parse one directive line (without the leading `#`). Malformed directives
/// are warned about and dropped.
pub fn parse_directive(rest: &str, syms: &mut Interner) -> Option<Directive> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        ["stratum"] => Some(Directive::Stratum),
        ["schemacheck", "on"] => Some(Directive::SchemaCheck(true)),
        ["schemacheck", "off"] => Some(Directive::SchemaCheck(false)),
        ["schema", id, attr, val, description @ ..] => {
            if *attr == "_" {
                warn!("ignoring schema with unconstrained attribute: #{rest}");
                return None;
            }
            let id = if *id == "_" { None } else { Some(syms.get_or_intern(*id)) };
            let val = if *val == "_" { None } else { Some(syms.get_or_intern(*val)) };
            Some(Directive::Schema {
                id,
                attr: syms.get_or_intern(*attr),
                val,
                description: description.join(" "),
            })
        }
        ["fuzzy", "system", name] => match FuzzySystem::from_name(name) {
            Some(sys) => Some(Directive::FuzzySystem(sys)),
            None => {
                warn!("unrecognized fuzzy system `{name}`; ignoring directive");
                None
            }
        },
        ["fuzzy", "kind", name, ..] => parse_fuzzy_kind(rest, name, syms),
        ["fuzzy", "var", name, kind] => Some(Directive::FuzzyVar {
            name: syms.get_or_intern(name),
            kind: syms.get_or_intern(kind),
        }),
        _ => {
            warn!("ignoring malformed directive: #{rest}");
            None
        }
    }
}

/// `kind NAME VAL:sigmoid A C, VAL:sigmoid A C, …`
fn parse_fuzzy_kind(rest: &str, name: &str, syms: &mut Interner) -> Option<Directive> {
    let specs = rest
        .split_whitespace()
        .skip(3)
        .collect::<Vec<_>>()
        .join(" ");
    let mut values = Vec::new();
    for piece in specs.split(',') {
        let toks: Vec<&str> = piece.split_whitespace().collect();
        let [head, a, c] = toks.as_slice() else {
            warn!("ignoring malformed fuzzy kind `{name}`: bad value spec `{piece}`");
            return None;
        };
        let Some((val_name, func)) = head.split_once(':') else {
            warn!("ignoring malformed fuzzy kind `{name}`: bad value spec `{piece}`");
            return None;
        };
        if func != "sigmoid" {
            warn!("ignoring fuzzy kind `{name}`: unsupported membership function `{func}`");
            return None;
        }
        let (Ok(a), Ok(c)) = (a.parse::<f64>(), c.parse::<f64>()) else {
            warn!("ignoring fuzzy kind `{name}`: non-numeric sigmoid parameters");
            return None;
        };
        if a == 0.0 || !a.is_finite() || !c.is_finite() {
            warn!("ignoring fuzzy kind `{name}`: invalid sigmoid parameters a={a} c={c}");
            return None;
        }
        values.push(FuzzyValueDef { name: syms.get_or_intern(val_name), a, c });
    }
    if values.is_empty() {
        warn!("ignoring fuzzy kind `{name}`: no value definitions");
        return None;
    }
    Some(Directive::FuzzyKind(FuzzyKind { name: syms.get_or_intern(name), values }))
}
