//! Text parsers feeding the sharder. Lines starting with `#` or `%` are
//! comments, self-edges are dropped, and malformed lines are reported and
//! skipped — one bad line never aborts an ingest.

use std::io::BufRead;

use tracing::{error, info};

use crate::error::{MolinoError, Result};
use crate::model::{EdgeValue, Vid};
use crate::preprocess::sharder::Sharder;

/// Drives a [`Sharder`] from one text representation. Implementations are
/// stateless; the same parser can ingest any number of files.
pub trait GraphIngest<E: EdgeValue> {
    fn ingest(&self, reader: &mut dyn BufRead, sharder: &mut Sharder<E>) -> Result<()>;
}

fn is_comment(line: &str) -> bool {
    matches!(line.as_bytes().first(), Some(b'#') | Some(b'%'))
}

fn parse_vid(tok: &str, what: &str, lineno: usize) -> Result<Vid> {
    tok.parse::<Vid>()
        .map_err(|e| MolinoError::Parse(format!("line {lineno}: bad {what} {tok:?}: {e}")))
}

/// `src dst [value]` per line, whitespace separated. A missing value takes
/// the edge type's default.
pub struct EdgeListParser;

impl<E: EdgeValue> GraphIngest<E> for EdgeListParser {
    fn ingest(&self, reader: &mut dyn BufRead, sharder: &mut Sharder<E>) -> Result<()> {
        info!("parse.edgelist.start");
        let mut lineno = 0usize;
        for line in reader.lines() {
            let line = line?;
            lineno += 1;
            if line.is_empty() || is_comment(&line) {
                continue;
            }
            match parse_edge_line::<E>(&line, lineno) {
                Ok(Some((src, dst, value))) => {
                    if src != dst {
                        sharder.add_edge(src, dst, value)?;
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    error!(error = %err, "parse.edgelist.bad_line");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn parse_edge_line<E: EdgeValue>(line: &str, lineno: usize) -> Result<Option<(Vid, Vid, E)>> {
    let mut toks = line.split_whitespace();
    let Some(src_tok) = toks.next() else {
        return Ok(None);
    };
    let dst_tok = toks.next().ok_or_else(|| {
        MolinoError::Parse(format!("line {lineno}: edge without destination: {line:?}"))
    })?;
    let src = parse_vid(src_tok, "source", lineno)?;
    let dst = parse_vid(dst_tok, "destination", lineno)?;
    let value = match toks.next() {
        Some(tok) => E::parse_token(tok)?,
        None => E::default(),
    };
    Ok(Some((src, dst, value)))
}

/// `src deg dst1 dst2 ...` per line. Edge values are not expressible in
/// this format; every edge takes the default. A degree that disagrees with
/// the listed destinations is reported, and the listed edges still count.
pub struct AdjacencyListParser;

impl<E: EdgeValue> GraphIngest<E> for AdjacencyListParser {
    fn ingest(&self, reader: &mut dyn BufRead, sharder: &mut Sharder<E>) -> Result<()> {
        info!("parse.adjlist.start");
        let mut lineno = 0usize;
        for line in reader.lines() {
            let line = line?;
            lineno += 1;
            if line.is_empty() || is_comment(&line) {
                continue;
            }
            if let Err(err) = ingest_adj_line::<E>(&line, lineno, sharder) {
                if err.is_recoverable() {
                    error!(error = %err, "parse.adjlist.bad_line");
                } else {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

fn ingest_adj_line<E: EdgeValue>(
    line: &str,
    lineno: usize,
    sharder: &mut Sharder<E>,
) -> Result<()> {
    let mut toks = line.split_whitespace();
    let Some(src_tok) = toks.next() else {
        return Ok(());
    };
    let src = parse_vid(src_tok, "source", lineno)?;
    let Some(deg_tok) = toks.next() else {
        return Ok(());
    };
    let declared = parse_vid(deg_tok, "degree", lineno)?;

    let mut listed: Vid = 0;
    for tok in toks {
        let dst = parse_vid(tok, "destination", lineno)?;
        if src != dst {
            sharder.add_edge(src, dst, E::default())?;
        }
        listed += 1;
    }
    if listed != declared {
        return Err(MolinoError::Parse(format!(
            "line {lineno}: vertex {src} declares degree {declared} but lists {listed}"
        )));
    }
    Ok(())
}
