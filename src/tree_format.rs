use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeFormatError {
    #[error("empty input")]
    Empty,

    #[error("unterminated comment")]
    UnterminatedComment,

    #[error("unterminated quoted label")]
    UnterminatedQuote,

    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("unexpected end of tree, missing ';'")]
    MissingTerminator,

    #[error("unbalanced parentheses")]
    Unbalanced,

    #[error("invalid branch length {0:?}")]
    BranchLength(String),

    #[error("tree has no labelled leaves")]
    NoTaxa,

    #[error("missing #NEXUS header")]
    NotNexus,

    #[error("NEXUS input contains no trees")]
    NoTrees,

    #[error("malformed NEXUS command: {0}")]
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeSchema {
    Newick,
    Nexus,
}

impl TreeSchema {
    pub fn sniff(first_line: &str) -> Self {
        if after_nexus_marker(first_line).is_some() {
            TreeSchema::Nexus
        } else {
            TreeSchema::Newick
        }
    }
}

fn after_nexus_marker(text: &str) -> Option<&str> {
    let trimmed = text.trim_start_matches(|ch: char| ch == '\u{feff}' || ch.is_whitespace());
    let prefix = trimmed.get(..6)?;
    if prefix.eq_ignore_ascii_case("#nexus") {
        trimmed.get(6..)
    } else {
        None
    }
}

impl fmt::Display for TreeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeSchema::Newick => write!(f, "newick"),
            TreeSchema::Nexus => write!(f, "nexus"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTree {
    pub name: Option<String>,
    pub leaves: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDocument {
    pub schema: TreeSchema,
    pub taxa: Vec<String>,
    pub trees: Vec<ParsedTree>,
}

impl TreeDocument {
    pub fn taxon_labels(&self) -> Vec<String> {
        let first = self
            .trees
            .first()
            .map(|tree| tree.leaves.as_slice())
            .unwrap_or(&[]);
        let mut seen = HashSet::new();
        let mut labels = Vec::new();
        for label in self.taxa.iter().chain(first.iter()) {
            if seen.insert(label.as_str()) {
                labels.push(label.clone());
            }
        }
        labels
    }
}

pub fn parse(text: &str, schema: TreeSchema) -> Result<TreeDocument, TreeFormatError> {
    match schema {
        TreeSchema::Newick => parse_newick(text),
        TreeSchema::Nexus => parse_nexus(text),
    }
}

pub fn parse_newick(text: &str) -> Result<TreeDocument, TreeFormatError> {
    let cleaned = strip_comments(text)?;
    let mut scanner = Scanner::new(&cleaned);
    let mut trees = Vec::new();
    loop {
        scanner.skip_ws();
        if scanner.at_end() {
            break;
        }
        trees.push(scanner.tree()?);
    }
    if trees.is_empty() {
        return Err(TreeFormatError::Empty);
    }
    Ok(TreeDocument {
        schema: TreeSchema::Newick,
        taxa: Vec::new(),
        trees,
    })
}

pub fn parse_nexus(text: &str) -> Result<TreeDocument, TreeFormatError> {
    let body = after_nexus_marker(text).ok_or(TreeFormatError::NotNexus)?;
    let cleaned = strip_comments(body)?;

    let mut taxa = Vec::new();
    let mut trees = Vec::new();
    let mut block: Option<String> = None;
    let mut translate: HashMap<String, String> = HashMap::new();

    for command in split_outside_quotes(&cleaned, ';')? {
        let command = command.trim();
        if command.is_empty() {
            continue;
        }
        let (keyword, rest) = match command.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (command, ""),
        };
        let keyword = keyword.to_ascii_lowercase();
        match (block.as_deref(), keyword.as_str()) {
            (_, "begin") => {
                block = Some(rest.to_ascii_lowercase());
                translate.clear();
            }
            (_, "end") | (_, "endblock") => block = None,
            (Some("taxa"), "taxlabels") => taxa.extend(words(rest)?),
            (Some("trees"), "translate") => translate.extend(parse_translate(rest)?),
            (Some("trees"), "tree") | (Some("trees"), "utree") => {
                trees.push(parse_tree_command(rest, &translate)?);
            }
            _ => {}
        }
    }

    if trees.is_empty() {
        return Err(TreeFormatError::NoTrees);
    }
    Ok(TreeDocument {
        schema: TreeSchema::Nexus,
        taxa,
        trees,
    })
}

fn parse_translate(rest: &str) -> Result<Vec<(String, String)>, TreeFormatError> {
    let mut pairs = Vec::new();
    for entry in split_outside_quotes(rest, ',')? {
        if entry.trim().is_empty() {
            continue;
        }
        let mut parts = words(&entry)?;
        if parts.len() != 2 {
            return Err(TreeFormatError::Command(format!("translate entry {entry:?}")));
        }
        let label = parts.remove(1);
        let key = parts.remove(0);
        pairs.push((key, label));
    }
    Ok(pairs)
}

fn parse_tree_command(
    rest: &str,
    translate: &HashMap<String, String>,
) -> Result<ParsedTree, TreeFormatError> {
    let split = find_outside_quotes(rest, '=')
        .ok_or_else(|| TreeFormatError::Command(format!("tree without '=': {rest:?}")))?;
    let name = words(rest[..split].trim_start_matches(|c: char| c == '*' || c.is_whitespace()))?
        .into_iter()
        .next();
    let newick = format!("{};", &rest[split + 1..]);
    let mut scanner = Scanner::new(&newick);
    let mut tree = scanner.tree()?;
    scanner.skip_ws();
    if let Some(found) = scanner.peek() {
        return Err(TreeFormatError::Unexpected {
            found,
            offset: scanner.pos,
        });
    }
    if !translate.is_empty() {
        for leaf in &mut tree.leaves {
            if let Some(label) = translate.get(leaf.as_str()) {
                *leaf = label.clone();
            }
        }
    }
    tree.name = name;
    Ok(tree)
}

fn words(text: &str) -> Result<Vec<String>, TreeFormatError> {
    let mut scanner = Scanner::new(text);
    let mut out = Vec::new();
    loop {
        scanner.skip_ws();
        if scanner.at_end() {
            break;
        }
        out.push(scanner.word()?);
    }
    Ok(out)
}

fn strip_comments(text: &str) -> Result<String, TreeFormatError> {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut in_quote = false;
    for ch in text.chars() {
        if in_quote {
            out.push(ch);
            if ch == '\'' {
                in_quote = false;
            }
            continue;
        }
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            '\'' => {
                in_quote = true;
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    if depth > 0 {
        return Err(TreeFormatError::UnterminatedComment);
    }
    if in_quote {
        return Err(TreeFormatError::UnterminatedQuote);
    }
    Ok(out)
}

fn split_outside_quotes(text: &str, separator: char) -> Result<Vec<String>, TreeFormatError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in text.chars() {
        if ch == '\'' {
            in_quote = !in_quote;
        }
        if ch == separator && !in_quote {
            parts.push(std::mem::take(&mut current));
            continue;
        }
        current.push(ch);
    }
    if in_quote {
        return Err(TreeFormatError::UnterminatedQuote);
    }
    parts.push(current);
    Ok(parts)
}

fn find_outside_quotes(text: &str, target: char) -> Option<usize> {
    let mut in_quote = false;
    for (index, ch) in text.char_indices() {
        if ch == '\'' {
            in_quote = !in_quote;
        } else if ch == target && !in_quote {
            return Some(index);
        }
    }
    None
}

fn is_delimiter(ch: char) -> bool {
    matches!(ch, '(' | ')' | '[' | ']' | '\'' | ':' | ';' | ',')
}

enum Expect {
    Subtree,
    AfterNode { closed: bool },
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_ws(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> TreeFormatError {
        match self.peek() {
            Some(found) => TreeFormatError::Unexpected {
                found,
                offset: self.pos,
            },
            None => TreeFormatError::MissingTerminator,
        }
    }

    fn tree(&mut self) -> Result<ParsedTree, TreeFormatError> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {}
            Some(_) => return Err(self.unexpected()),
            None => return Err(TreeFormatError::Empty),
        }

        let mut depth = 0usize;
        let mut leaves = Vec::new();
        let mut expect = Expect::Subtree;
        loop {
            self.skip_ws();
            match expect {
                Expect::Subtree => match self.peek() {
                    Some('(') => {
                        self.pos += 1;
                        depth += 1;
                    }
                    Some(',') | Some(')') | Some(':') => {
                        expect = Expect::AfterNode { closed: false };
                    }
                    Some(ch) if is_delimiter(ch) && ch != '\'' => return Err(self.unexpected()),
                    Some(_) => {
                        let label = self.label()?;
                        if !label.is_empty() {
                            leaves.push(label);
                        }
                        expect = Expect::AfterNode { closed: false };
                    }
                    None => return Err(TreeFormatError::MissingTerminator),
                },
                Expect::AfterNode { closed } => {
                    if closed && matches!(self.peek(), Some(ch) if ch == '\'' || !is_delimiter(ch))
                    {
                        self.label()?;
                        self.skip_ws();
                    }
                    if self.peek() == Some(':') {
                        self.pos += 1;
                        self.skip_ws();
                        self.branch_length()?;
                        self.skip_ws();
                    }
                    match self.peek() {
                        Some(',') if depth > 0 => {
                            self.pos += 1;
                            expect = Expect::Subtree;
                        }
                        Some(')') if depth > 0 => {
                            self.pos += 1;
                            depth -= 1;
                            expect = Expect::AfterNode { closed: true };
                        }
                        Some(';') if depth == 0 => {
                            self.pos += 1;
                            break;
                        }
                        Some(',') | Some(')') | Some(';') => {
                            return Err(TreeFormatError::Unbalanced);
                        }
                        Some(_) => return Err(self.unexpected()),
                        None if depth > 0 => return Err(TreeFormatError::Unbalanced),
                        None => return Err(TreeFormatError::MissingTerminator),
                    }
                }
            }
        }

        if leaves.is_empty() {
            return Err(TreeFormatError::NoTaxa);
        }
        Ok(ParsedTree { name: None, leaves })
    }

    fn label(&mut self) -> Result<String, TreeFormatError> {
        if self.peek() == Some('\'') {
            return self.quoted();
        }
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || is_delimiter(ch) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.unexpected());
        }
        Ok(unquoted(&self.chars[start..self.pos]))
    }

    fn word(&mut self) -> Result<String, TreeFormatError> {
        if self.peek() == Some('\'') {
            return self.quoted();
        }
        let start = self.pos;
        while self.peek().map(|ch| !ch.is_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
        Ok(unquoted(&self.chars[start..self.pos]))
    }

    fn quoted(&mut self) -> Result<String, TreeFormatError> {
        self.pos += 1;
        let mut label = String::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(TreeFormatError::UnterminatedQuote);
            };
            self.pos += 1;
            if ch == '\'' {
                if self.peek() == Some('\'') {
                    self.pos += 1;
                    label.push('\'');
                    continue;
                }
                return Ok(label.trim().to_string());
            }
            label.push(ch);
        }
    }

    fn branch_length(&mut self) -> Result<(), TreeFormatError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || is_delimiter(ch) {
                break;
            }
            self.pos += 1;
        }
        let raw: String = self.chars[start..self.pos].iter().collect();
        raw.parse::<f64>()
            .map(|_| ())
            .map_err(|_| TreeFormatError::BranchLength(raw))
    }
}

/// Unquoted labels read underscores as blanks.
fn unquoted(chars: &[char]) -> String {
    chars
        .iter()
        .map(|&ch| if ch == '_' { ' ' } else { ch })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn newick_leaves_in_order() {
        let doc = parse_newick("((Quercus_robur:0.1,Quercus_alba:0.2)95:0.05,Fagus_sylvatica);")
            .unwrap();
        assert_eq!(doc.trees.len(), 1);
        assert_eq!(
            doc.trees[0].leaves,
            vec!["Quercus robur", "Quercus alba", "Fagus sylvatica"]
        );
    }

    #[test]
    fn newick_quoted_labels_and_comments() {
        let doc = parse_newick("[&R] ('Rosa canina'[x],'O''Brien':1e-3,(A,B)'node x');").unwrap();
        assert_eq!(doc.trees[0].leaves, vec!["Rosa canina", "O'Brien", "A", "B"]);
    }

    #[test]
    fn newick_multiple_trees() {
        let doc = parse_newick("(A,B);\n(C,(D,E));\n").unwrap();
        assert_eq!(doc.trees.len(), 2);
        assert_eq!(doc.taxon_labels(), vec!["A", "B"]);
    }

    #[test]
    fn newick_rejects_malformed_text() {
        assert_matches!(parse_newick("(A,B"), Err(TreeFormatError::Unbalanced));
        assert_matches!(parse_newick("(A,B)"), Err(TreeFormatError::MissingTerminator));
        assert_matches!(parse_newick("(A,B));"), Err(TreeFormatError::Unbalanced));
        assert_matches!(parse_newick("();"), Err(TreeFormatError::NoTaxa));
        assert_matches!(parse_newick("(A:x,B);"), Err(TreeFormatError::BranchLength(_)));
        assert_matches!(parse_newick(""), Err(TreeFormatError::Empty));
        assert!(parse_newick("Sequences were aligned with MAFFT; see methods.").is_err());
        assert!(parse_newick("(A B,C);").is_err());
    }

    #[test]
    fn deep_nesting_does_not_recurse() {
        let depth = 100_000;
        let text = format!("{}A{};", "(".repeat(depth), ")".repeat(depth));
        let doc = parse_newick(&text).unwrap();
        assert_eq!(doc.trees[0].leaves, vec!["A"]);
    }

    #[test]
    fn nexus_translate_and_taxa() {
        let text = concat!(
            "#NEXUS\n",
            "BEGIN TAXA;\n",
            "  DIMENSIONS NTAX=3;\n",
            "  TAXLABELS Quercus_robur Quercus_alba 'Fagus sylvatica';\n",
            "END;\n",
            "BEGIN TREES;\n",
            "  TRANSLATE\n",
            "    1 Quercus_robur,\n",
            "    2 Quercus_alba,\n",
            "    3 'Fagus sylvatica';\n",
            "  TREE * tree1 = [&R] ((1:0.1,2:0.2):0.3,3:0.4);\n",
            "END;\n",
        );
        let doc = parse_nexus(text).unwrap();
        assert_eq!(doc.schema, TreeSchema::Nexus);
        assert_eq!(doc.trees[0].name.as_deref(), Some("tree1"));
        assert_eq!(
            doc.trees[0].leaves,
            vec!["Quercus robur", "Quercus alba", "Fagus sylvatica"]
        );
        assert_eq!(doc.taxon_labels().len(), 3);
    }

    #[test]
    fn nexus_without_trees_is_rejected() {
        let text =
            "#NEXUS\nBEGIN DATA;\nDIMENSIONS NTAX=2 NCHAR=3;\nMATRIX\nA ACG\nB ACT\n;\nEND;\n";
        assert_matches!(parse_nexus(text), Err(TreeFormatError::NoTrees));
        assert_matches!(parse_nexus("(A,B);"), Err(TreeFormatError::NotNexus));
    }

    #[test]
    fn sniff_schema_from_first_line() {
        assert_eq!(TreeSchema::sniff("#NEXUS"), TreeSchema::Nexus);
        assert_eq!(TreeSchema::sniff("  #nexus [written by x]"), TreeSchema::Nexus);
        assert_eq!(TreeSchema::sniff("((A,B),C);"), TreeSchema::Newick);
        assert_eq!(TreeSchema::sniff("#NEX"), TreeSchema::Newick);
        assert_eq!(TreeSchema::sniff("\u{a0}#Nex\u{e9}s"), TreeSchema::Newick);
    }

    #[test]
    fn nexus_after_bom_and_unicode_blanks() {
        let text = " \u{feff}\u{a0}\u{2003}#NEXUS\nBEGIN TREES;\nTREE t = (A,B);\nEND;\n";
        assert_eq!(TreeSchema::sniff(text), TreeSchema::Nexus);
        let doc = parse_nexus(text).unwrap();
        assert_eq!(doc.trees[0].leaves, vec!["A", "B"]);
        assert_matches!(
            parse_nexus("\u{feff}\u{2003}\u{2003}#NEXU\u{e9}"),
            Err(TreeFormatError::NotNexus)
        );
    }
}
