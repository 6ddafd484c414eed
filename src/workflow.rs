use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::refine::{Refinement, Refiner};
use crate::sampler::Sampler;
use crate::tokenizer::PieceTokenizer;

/// Seed token to refined text, in first-seen order. Re-inserting a token
/// replaces its text but keeps its position. A prompt yields a few dozen
/// pieces at most, so lookups scan a `Vec`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefinedMap {
    entries: Vec<(String, String)>,
}

impl RefinedMap {
    pub fn insert(&mut self, token: String, text: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == token) {
            Some(entry) => entry.1 = text,
            None => self.entries.push((token, text)),
        }
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == token)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Serialize)]
struct Record<'a> {
    seed_token: &'a str,
    generated_text: &'a str,
}

/// Everything the prompt loop needs, built once at startup.
pub struct Workflow {
    tokenizer: Box<dyn PieceTokenizer>,
    sampler: Box<dyn Sampler>,
    refiner: Refiner,
}

impl Workflow {
    pub fn new(
        tokenizer: Box<dyn PieceTokenizer>,
        sampler: Box<dyn Sampler>,
        refiner: Refiner,
    ) -> Self {
        Self {
            tokenizer,
            sampler,
            refiner,
        }
    }

    /// Generates and refines one text per piece, writing a JSON record per
    /// piece to `out` as it completes.
    pub fn process_pieces<W: Write>(&mut self, pieces: &[String], out: &mut W) -> Result<RefinedMap> {
        let mut refined = RefinedMap::default();
        for token in pieces {
            let raw = self.sampler.generate(token);
            let refinement = self.refiner.refine(&raw, token);
            if let Refinement::Unrefined { reason, .. } = &refinement {
                debug!(token = token.as_str(), %reason, "kept unrefined text");
            }
            let text = refinement.into_text();
            let line = serde_json::to_string(&Record {
                seed_token: token,
                generated_text: &text,
            })?;
            writeln!(out, "{line}").context("write record")?;
            out.flush().context("flush record")?;
            refined.insert(token.clone(), text);
        }
        Ok(refined)
    }

    pub fn process_prompt<W: Write>(&mut self, prompt: &str, out: &mut W) -> Result<RefinedMap> {
        let pieces = match self.tokenizer.pieces(prompt) {
            Ok(pieces) => pieces,
            Err(err) => {
                warn!("tokenize failed: {err:#}");
                Vec::new()
            }
        };
        debug!(?pieces, "tokenized prompt");
        self.process_pieces(&pieces, out)
    }

    /// Reads prompts until `exit`/`quit` or end of input.
    pub fn run_interactive<R: BufRead, W: Write, E: Write>(
        &mut self,
        mut input: R,
        out: &mut W,
        summary: &mut E,
    ) -> Result<()> {
        let mut line = String::new();
        loop {
            write!(out, "Enter a prompt (exit/quit to stop): ").context("write prompt marker")?;
            out.flush().context("flush prompt marker")?;

            line.clear();
            let n = input.read_line(&mut line).context("read stdin line")?;
            if n == 0 {
                break;
            }
            let prompt = line.trim();
            if prompt.eq_ignore_ascii_case("exit") || prompt.eq_ignore_ascii_case("quit") {
                break;
            }
            if prompt.is_empty() {
                continue;
            }

            let refined = self.process_prompt(prompt, out)?;
            write_summary(&refined, summary)?;
        }
        writeln!(summary, "Bye.").context("write farewell")?;
        Ok(())
    }
}

pub fn write_summary<E: Write>(refined: &RefinedMap, summary: &mut E) -> Result<()> {
    writeln!(summary, "--- final results ---").context("write summary header")?;
    for (token, text) in refined.iter() {
        writeln!(summary, "[{token}] {text}").context("write summary line")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::tests::ScriptedBackend;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    /// Splits on whitespace and marks word starts the way SentencePiece does.
    struct WordPieces;

    impl PieceTokenizer for WordPieces {
        fn pieces(&self, text: &str) -> Result<Vec<String>> {
            Ok(text.split_whitespace().map(|w| format!("▁{w}")).collect())
        }
    }

    /// Echoes the seed back as its "generation" and counts calls.
    #[derive(Clone, Default)]
    struct EchoSampler {
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl Sampler for EchoSampler {
        fn generate(&mut self, seed_token: &str) -> String {
            self.calls.borrow_mut().push(seed_token.to_string());
            if seed_token.contains("silent") {
                String::new()
            } else {
                format!("raw {seed_token}")
            }
        }
    }

    fn workflow(sampler: EchoSampler, backend: ScriptedBackend) -> Workflow {
        Workflow::new(
            Box::new(WordPieces),
            Box::new(sampler),
            Refiner::new(Box::new(backend)),
        )
    }

    fn pieces(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn map_overwrites_in_place() {
        let mut m = RefinedMap::default();
        m.insert("a".into(), "1".into());
        m.insert("b".into(), "2".into());
        m.insert("a".into(), "3".into());
        assert_eq!(m.len(), 2);
        assert_eq!(m.iter().collect::<Vec<_>>(), [("a", "3"), ("b", "2")]);
        assert_eq!(m.get("b"), Some("2"));
        assert_eq!(m.get("c"), None);
    }

    #[test]
    fn each_piece_is_generated_and_refined() -> Result<()> {
        let sampler = EchoSampler::default();
        let calls = sampler.calls.clone();
        let mut wf = workflow(sampler, ScriptedBackend::replying(&["refined"]));
        let mut out = Vec::<u8>::new();
        let map = wf.process_pieces(&pieces(&["▁hel", "lo"]), &mut out)?;

        assert_eq!(*calls.borrow(), ["▁hel", "lo"]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("▁hel"), Some("refined"));
        let text = String::from_utf8(out)?;
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["seed_token"], "lo");
        assert_eq!(lines[1]["generated_text"], "refined");
        Ok(())
    }

    #[test]
    fn duplicate_pieces_keep_one_entry() -> Result<()> {
        let mut wf = workflow(EchoSampler::default(), ScriptedBackend::failing());
        let mut out = Vec::<u8>::new();
        let map = wf.process_pieces(&pieces(&["▁hel", "lo", "▁hel"]), &mut out)?;
        assert_eq!(map.len(), 2);
        // refinement failed, so the raw generation comes through
        assert_eq!(map.get("▁hel"), Some("raw ▁hel"));
        assert_eq!(String::from_utf8(out)?.lines().count(), 3);
        Ok(())
    }

    #[test]
    fn empty_generation_is_not_sent_for_refinement() -> Result<()> {
        let backend = ScriptedBackend::replying(&["should not appear"]);
        let prompts = backend.prompts.clone();
        let mut wf = workflow(EchoSampler::default(), backend);
        let map = wf.process_pieces(&pieces(&["silent"]), &mut Vec::<u8>::new())?;
        assert_eq!(map.get("silent"), Some(""));
        assert!(prompts.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn interactive_loop_stops_on_quit() -> Result<()> {
        let sampler = EchoSampler::default();
        let calls = sampler.calls.clone();
        let mut wf = workflow(sampler, ScriptedBackend::replying(&["ok"]));
        let input = Cursor::new("hello world\n\n  \nQUIT\nnever seen\n");
        let (mut out, mut summary) = (Vec::<u8>::new(), Vec::<u8>::new());
        wf.run_interactive(input, &mut out, &mut summary)?;

        assert_eq!(*calls.borrow(), ["▁hello", "▁world"]);
        let summary = String::from_utf8(summary)?;
        assert!(summary.contains("--- final results ---"));
        assert!(summary.contains("[▁world] ok"));
        assert!(summary.ends_with("Bye.\n"));
        Ok(())
    }

    #[test]
    fn interactive_loop_stops_at_eof() -> Result<()> {
        let sampler = EchoSampler::default();
        let calls = sampler.calls.clone();
        let mut wf = workflow(sampler, ScriptedBackend::replying(&["ok"]));
        wf.run_interactive(Cursor::new("one"), &mut Vec::<u8>::new(), &mut Vec::<u8>::new())?;
        assert_eq!(*calls.borrow(), ["▁one"]);
        Ok(())
    }
}
