//! Structural feature extraction for Python submissions.
//!
//! A single pass over the token stream tracks block nesting (functions,
//! loops, other compound statements) and collects the raw signals; the
//! error class is then picked from an explicit ranked rule list.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::lexer::{is_keyword, tokenize, Token, TokenKind};
use crate::model::ErrorClass;

/// Coarse big-O estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    #[serde(rename = "O(1)")]
    Constant,
    #[serde(rename = "O(n)")]
    Linear,
    #[serde(rename = "O(n log n)")]
    Linearithmic,
    #[serde(rename = "O(n^2)")]
    Quadratic,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Constant => "O(1)",
            Complexity::Linear => "O(n)",
            Complexity::Linearithmic => "O(n log n)",
            Complexity::Quadratic => "O(n^2)",
            Complexity::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw heuristic signals; several may fire at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signals {
    /// `for .. in range(.., len(..), ..)`.
    pub off_by_one: bool,
    pub missing_base_case: bool,
    pub wrong_data_structure: bool,
    pub brute_force: bool,
    pub hardcoded_values: bool,
    /// Integer literal used as the stop bound of a `range`.
    pub generalization_failure: bool,
    pub approach_mismatch: bool,
}

/// Everything the extractor learned about one program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeProfile {
    pub syntax_error: bool,
    pub uses_recursion: bool,
    pub nested_loops: bool,
    pub max_loop_depth: usize,
    pub loop_count: usize,
    pub uses_sorting: bool,
    pub complexity: Complexity,
    pub signals: Signals,
    pub error_class: ErrorClass,
}

impl CodeProfile {
    /// Profile of a program that does not parse.
    pub fn syntax_error() -> Self {
        Self {
            syntax_error: true,
            complexity: Complexity::Unknown,
            error_class: ErrorClass::SyntaxError,
            ..Self::default()
        }
    }

    /// Profile of a program the runtime accepted but this extractor could
    /// not follow; carries no signals.
    pub fn opaque() -> Self {
        Self::default()
    }
}

type Rule = fn(&CodeProfile) -> bool;

/// Classification order; the first rule that holds names the error class.
const RANKED_RULES: [(ErrorClass, Rule); 8] = [
    (ErrorClass::SyntaxError, |p| p.syntax_error),
    (ErrorClass::MissingBaseCase, |p| p.signals.missing_base_case),
    (ErrorClass::OffByOne, |p| p.signals.off_by_one),
    (ErrorClass::WrongDataStructure, |p| {
        p.signals.wrong_data_structure
    }),
    (ErrorClass::BruteForce, |p| p.signals.brute_force),
    (ErrorClass::HardcodedValues, |p| p.signals.hardcoded_values),
    (ErrorClass::GeneralizationFailure, |p| {
        p.signals.generalization_failure
    }),
    (ErrorClass::ApproachMismatch, |p| p.signals.approach_mismatch),
];

pub fn classify(profile: &CodeProfile) -> ErrorClass {
    RANKED_RULES
        .iter()
        .find(|(_, holds)| holds(profile))
        .map(|(class, _)| *class)
        .unwrap_or(ErrorClass::None)
}

fn estimate_complexity(profile: &CodeProfile) -> Complexity {
    if profile.syntax_error {
        Complexity::Unknown
    } else if profile.nested_loops {
        Complexity::Quadratic
    } else if profile.uses_sorting {
        Complexity::Linearithmic
    } else if profile.loop_count > 0 || profile.uses_recursion {
        Complexity::Linear
    } else {
        Complexity::Constant
    }
}

/// Analyse a Python program. Never fails: code that cannot be tokenized or
/// has broken block structure yields [`CodeProfile::syntax_error`].
pub fn extract_features(code: &str) -> CodeProfile {
    let tokens = match tokenize(code) {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "submission does not tokenize");
            return CodeProfile::syntax_error();
        }
    };

    let mut walker = Walker::default();
    walker.walk(&tokens);
    if walker.broken {
        debug!("submission has broken block structure");
        return CodeProfile::syntax_error();
    }

    let profile = walker.finish();
    debug!(
        error_class = %profile.error_class,
        complexity = %profile.complexity,
        loops = profile.loop_count,
        recursion = profile.uses_recursion,
        nested = profile.nested_loops,
        "features extracted"
    );
    profile
}

// ---------------------------------------------------------------------------
// Block walker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Function(String),
    Loop,
    Block,
}

#[derive(Debug, Default)]
struct FunctionFacts {
    calls: BTreeSet<String>,
    returns: usize,
    literal_returns: usize,
}

#[derive(Debug, Default)]
struct Walker {
    frames: Vec<Frame>,
    /// Header whose body is expected on the next indented line.
    pending: Option<Frame>,
    functions: BTreeMap<String, FunctionFacts>,
    loop_count: usize,
    max_loop_depth: usize,
    uses_sorting: bool,
    uses_dict: bool,
    off_by_one: bool,
    magic_bound: bool,
    broken: bool,
}

const COMPOUND: [&str; 11] = [
    "if", "elif", "else", "try", "except", "finally", "with", "class", "while", "for", "def",
];

impl Walker {
    fn walk(&mut self, tokens: &[Token]) {
        let mut line: Vec<&Token> = Vec::new();
        for token in tokens {
            match token.kind {
                TokenKind::Newline => {
                    self.logical_line(&line);
                    line.clear();
                }
                TokenKind::Indent => match self.pending.take() {
                    Some(frame) => self.frames.push(frame),
                    None => self.broken = true,
                },
                TokenKind::Dedent => {
                    if self.frames.pop().is_none() {
                        self.broken = true;
                    }
                }
                _ => line.push(token),
            }
            if self.broken {
                return;
            }
        }
        if self.pending.is_some() || !line.is_empty() {
            self.broken = true;
        }
    }

    fn loop_depth(&self) -> usize {
        self.frames.iter().filter(|f| **f == Frame::Loop).count()
    }

    fn current_function(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Function(name) => Some(name.as_str()),
            _ => None,
        })
    }

    fn logical_line(&mut self, line: &[&Token]) {
        if self.pending.take().is_some() {
            // Header not followed by an indented block.
            self.broken = true;
            return;
        }
        let mut line = line;
        if line.first().is_some_and(|t| t.is_name("async")) {
            line = &line[1..];
        }
        let Some(first) = line.first() else {
            return;
        };

        let is_header = first.kind == TokenKind::Name
            && (COMPOUND.contains(&first.lexeme.as_str())
                || (matches!(first.lexeme.as_str(), "match" | "case")
                    && line.last().is_some_and(|t| t.is_op(":"))
                    && line.len() > 2));
        if is_header {
            self.compound(line);
        } else {
            self.simple_statements(line);
        }
    }

    fn compound(&mut self, line: &[&Token]) {
        let Some(colon) = header_colon(line) else {
            self.broken = true;
            return;
        };
        let header = &line[1..colon];
        let body = &line[colon + 1..];

        let frame = match line[0].lexeme.as_str() {
            "def" => {
                let Some(name) = header.first().filter(|t| t.kind == TokenKind::Name) else {
                    self.broken = true;
                    return;
                };
                // Default values are evaluated in the enclosing scope.
                self.expression(&header[1..]);
                self.functions
                    .insert(name.lexeme.clone(), FunctionFacts::default());
                Frame::Function(name.lexeme.clone())
            }
            "for" => {
                self.enter_loop();
                self.check_range_bounds(header);
                self.expression(header);
                Frame::Loop
            }
            "while" => {
                self.enter_loop();
                self.expression(header);
                Frame::Loop
            }
            "class" => {
                self.expression(header.get(1..).unwrap_or_default());
                Frame::Block
            }
            _ => {
                self.expression(header);
                Frame::Block
            }
        };

        if body.is_empty() {
            self.pending = Some(frame);
        } else {
            self.frames.push(frame);
            self.simple_statements(body);
            self.frames.pop();
        }
    }

    fn enter_loop(&mut self) {
        self.loop_count += 1;
        self.max_loop_depth = self.max_loop_depth.max(self.loop_depth() + 1);
    }

    fn simple_statements(&mut self, tokens: &[&Token]) {
        for statement in split_top_level(tokens, ";") {
            if statement.first().is_some_and(|t| t.is_name("return")) {
                self.return_statement(&statement[1..]);
            }
            self.expression(statement);
        }
    }

    fn return_statement(&mut self, value: &[&Token]) {
        let literal = is_literal_expression(value);
        let Some(name) = self.current_function().map(str::to_string) else {
            return;
        };
        if let Some(facts) = self.functions.get_mut(&name) {
            facts.returns += 1;
            if literal {
                facts.literal_returns += 1;
            }
        }
    }

    /// Record calls, sorting and dict usage in an expression.
    fn expression(&mut self, tokens: &[&Token]) {
        let function = self.current_function().map(str::to_string);
        for (i, token) in tokens.iter().enumerate() {
            if token.kind == TokenKind::Name
                && !is_keyword(&token.lexeme)
                && tokens.get(i + 1).is_some_and(|t| t.is_op("("))
            {
                let name = token.lexeme.as_str();
                if name == "sorted" || name == "sort" {
                    self.uses_sorting = true;
                }
                if let Some(facts) = function.as_deref().and_then(|f| self.functions.get_mut(f)) {
                    facts.calls.insert(name.to_string());
                }
            }
            if token.is_op("{") && opens_dict(&tokens[i..]) {
                self.uses_dict = true;
            }
        }
    }

    /// Inspect `for <target> in range(...)` arguments.
    fn check_range_bounds(&mut self, header: &[&Token]) {
        let mut depth = 0i32;
        let Some(in_pos) = header.iter().position(|t| {
            depth += bracket_delta(t);
            depth == 0 && t.is_name("in")
        }) else {
            return;
        };
        let iter = &header[in_pos + 1..];
        if !(iter.len() >= 3 && iter[0].is_name("range") && iter[1].is_op("(")) {
            return;
        }
        if matching_close(iter, 1) != Some(iter.len() - 1) {
            return;
        }

        let args = split_top_level(&iter[2..iter.len() - 1], ",");
        if args.iter().any(|arg| is_len_call(arg)) {
            self.off_by_one = true;
        }
        // Only the stop bound generalizes; a literal start or step is fine.
        let stop = match args.len() {
            1 => args.first(),
            _ => args.get(1),
        };
        if stop.is_some_and(|arg| arg.len() == 1 && arg[0].is_int_literal()) {
            self.magic_bound = true;
        }
    }

    fn finish(self) -> CodeProfile {
        let recursive: BTreeSet<&str> = self
            .functions
            .iter()
            .filter(|(name, facts)| facts.calls.contains(*name))
            .map(|(name, _)| name.as_str())
            .collect();

        let nested_loops = self.max_loop_depth >= 2;
        let missing_base_case = recursive
            .iter()
            .any(|name| self.functions.get(*name).is_some_and(|f| f.literal_returns == 0));
        let hardcoded_values = self.loop_count == 0
            && self.functions.iter().any(|(name, facts)| {
                facts.returns > 0
                    && facts.returns == facts.literal_returns
                    && !recursive.contains(name.as_str())
            });

        let signals = Signals {
            off_by_one: self.off_by_one,
            missing_base_case,
            wrong_data_structure: nested_loops && !self.uses_dict,
            brute_force: nested_loops && !self.uses_sorting,
            hardcoded_values,
            generalization_failure: self.magic_bound,
            approach_mismatch: self.loop_count > 0 && nested_loops && !self.uses_sorting,
        };

        let mut profile = CodeProfile {
            syntax_error: false,
            uses_recursion: !recursive.is_empty(),
            nested_loops,
            max_loop_depth: self.max_loop_depth,
            loop_count: self.loop_count,
            uses_sorting: self.uses_sorting,
            complexity: Complexity::Unknown,
            signals,
            error_class: ErrorClass::None,
        };
        profile.complexity = estimate_complexity(&profile);
        profile.error_class = classify(&profile);
        profile
    }
}

// ---------------------------------------------------------------------------
// Token helpers
// ---------------------------------------------------------------------------

fn bracket_delta(token: &Token) -> i32 {
    if token.kind != TokenKind::Op {
        return 0;
    }
    match token.lexeme.as_str() {
        "(" | "[" | "{" => 1,
        ")" | "]" | "}" => -1,
        _ => 0,
    }
}

/// Index of the bracket closing the one opened at `open`.
fn matching_close(tokens: &[&Token], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        depth += bracket_delta(token);
        if depth == 0 {
            return Some(i);
        }
    }
    None
}

fn split_top_level<'a, 't>(tokens: &'a [&'t Token], separator: &str) -> Vec<&'a [&'t Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        depth += bracket_delta(token);
        if depth == 0 && token.is_op(separator) {
            parts.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    parts.push(&tokens[start..]);
    parts.retain(|p| !p.is_empty());
    parts
}

/// The colon ending a compound statement header, skipping lambda colons.
fn header_colon(line: &[&Token]) -> Option<usize> {
    let mut depth = 0i32;
    let mut lambdas = 0usize;
    for (i, token) in line.iter().enumerate().skip(1) {
        depth += bracket_delta(token);
        if depth != 0 {
            continue;
        }
        if token.is_name("lambda") {
            lambdas += 1;
        } else if token.is_op(":") {
            if lambdas == 0 {
                return Some(i);
            }
            lambdas -= 1;
        }
    }
    None
}

fn is_len_call(arg: &[&Token]) -> bool {
    arg.len() >= 3
        && arg[0].is_name("len")
        && arg[1].is_op("(")
        && matching_close(arg, 1) == Some(arg.len() - 1)
}

/// `{...}` starting at `tokens[0]` is a dict display or comprehension.
fn opens_dict(tokens: &[&Token]) -> bool {
    let Some(close) = matching_close(tokens, 0) else {
        return false;
    };
    if close == 1 {
        return true;
    }
    let mut depth = 0i32;
    let mut element_start = true;
    for token in &tokens[1..close] {
        if depth == 0 && (token.is_op(":") || (element_start && token.is_op("**"))) {
            return true;
        }
        depth += bracket_delta(token);
        element_start = depth == 0 && token.is_op(",");
    }
    false
}

const BINARY_OPS: [&str; 18] = [
    "+", "-", "*", "/", "//", "%", "@", "<<", ">>", "&", "|", "^", "<", ">", "==", "!=", "<=",
    ">=",
];
const BINARY_WORDS: [&str; 6] = ["and", "or", "if", "in", "is", "not"];

/// A return value that is a constant or a unary operation on one operand.
fn is_literal_expression(tokens: &[&Token]) -> bool {
    let Some(first) = tokens.first() else {
        return false;
    };

    if tokens.iter().all(|t| t.kind == TokenKind::Str) {
        return true;
    }
    if tokens.len() == 1 {
        return first.kind == TokenKind::Number
            || first.is_op("...")
            || ["None", "True", "False"].iter().any(|w| first.is_name(w));
    }

    if first.is_name("not") {
        return !has_top_level(&tokens[1..], |t| {
            t.is_name("and") || t.is_name("or") || t.is_name("if") || t.is_op(",")
        });
    }

    let operand_start = tokens
        .iter()
        .position(|t| !(t.is_op("-") || t.is_op("+") || t.is_op("~")))
        .unwrap_or(tokens.len());
    if operand_start == 0 || operand_start == tokens.len() {
        return false;
    }
    !has_top_level(&tokens[operand_start..], |t| {
        (t.kind == TokenKind::Op && (BINARY_OPS.contains(&t.lexeme.as_str()) || t.lexeme == ","))
            || (t.kind == TokenKind::Name && BINARY_WORDS.contains(&t.lexeme.as_str()))
    })
}

fn has_top_level(tokens: &[&Token], pred: impl Fn(&Token) -> bool) -> bool {
    let mut depth = 0i32;
    for token in tokens {
        if depth == 0 && pred(token) {
            return true;
        }
        depth += bracket_delta(token);
    }
    false
}
