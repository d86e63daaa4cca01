//! Interactive shell
//!
//! One command per line; anything that is not a recognized command is
//! treated as a chat prompt (when the chat path is available). Each command
//! runs to completion, including any cycle loop it triggers, before the
//! next prompt is shown.

#![forbid(unsafe_code)]

use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use tracing::warn;

use crate::chat::ChatSession;
use crate::engine::Reasoner;
use crate::parse::{Clause, Item};

const HELP: &str = "\
Commands:
  quit | exit | bye        leave the shell
  help [cmd]               this text, or details for one command
  retract ID ATTR VAL      withdraw an axiomatic/defuzzification reason
  explain ID ATTR VAL      print the justification tree of a fact
  run <clauses>            execute clauses, then run to fixed point
  clear                    drop working memory (rules survive)
Anything else is sent to the chat assistant (needs OPENAI_API_KEY).";

fn help_for(cmd: &str) -> &'static str {
    match cmd {
        "retract" => "retract ID ATTR VAL: withdraw one axiomatic or \
                      defuzzification justification; the fact disappears \
                      when its last reason goes, and the knowledge base \
                      re-stabilizes.",
        "explain" => "explain ID ATTR VAL: print why a fact is in working \
                      memory, as a tree of justifications. `(*)` marks a \
                      back-reference to a fact already on the path.",
        "run" => "run <clauses>: parse the rest of the line as program \
                  text (facts, productions, queries) and execute it.",
        "clear" => "clear: drop all facts and justifications; productions, \
                    strata, schemas, and fuzzy definitions survive.",
        "quit" | "exit" | "bye" => "leave the shell.",
        _ => HELP,
    }
}

pub fn repl(reasoner: &mut Reasoner) {
    let mut editor = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("retort".to_string()),
        DefaultPromptSegment::Empty,
    );
    let mut chat = ChatSession::from_env();

    loop {
        match editor.read_line(&prompt) {
            Ok(Signal::Success(line)) => {
                if !dispatch(reasoner, &mut chat, line.trim()) {
                    break;
                }
            }
            Ok(Signal::CtrlC) | Ok(Signal::CtrlD) => break,
            Err(e) => {
                warn!("read error: {e}");
                break;
            }
        }
    }
}

/// Returns false when the shell should exit.
fn dispatch(reasoner: &mut Reasoner, chat: &mut ChatSession, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    match cmd {
        "quit" | "exit" | "bye" => return false,
        "help" => println!("{}", help_for(rest)),
        "retract" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
            [id, attr, val] => reasoner.retract(id, attr, val),
            _ => println!("usage: retract ID ATTR VAL"),
        },
        "explain" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
            [id, attr, val] => println!("{}", reasoner.explain(id, attr, val)),
            _ => println!("usage: explain ID ATTR VAL"),
        },
        "run" => {
            if rest.is_empty() {
                println!("usage: run <clauses>");
            } else if let Err(e) = reasoner.load(rest) {
                println!("error: {e}");
            }
        }
        "clear" => reasoner.clear(),
        _ => chat_query(reasoner, chat, line),
    }
    true
}

/// Route a free-form prompt through the chat translator and execute the
/// query clause it returns.
fn chat_query(reasoner: &mut Reasoner, chat: &mut ChatSession, prompt: &str) {
    if !chat.is_available() {
        println!("Unrecognized command (and no OPENAI_API_KEY set). Try `help`.");
        return;
    }
    let Some(clause_text) = chat.translate(prompt) else {
        return;
    };
    println!("query: {clause_text}");
    run_query_text(reasoner, &clause_text);
}

fn run_query_text(reasoner: &mut Reasoner, text: &str) {
    match reasoner.parse_items(text) {
        Ok(items) => {
            let mut answered = false;
            for item in &items {
                if let Item::Clause(Clause::Query { lhs, vars }) = item {
                    println!("{}", reasoner.answer_query(lhs, vars));
                    answered = true;
                }
            }
            if !answered {
                println!("The assistant did not produce a query; ignoring.");
            }
        }
        Err(e) => println!("could not parse the assistant's answer: {e}"),
    }
}
