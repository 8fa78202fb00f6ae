//! Prompt builders
//!
//! Every reasoning call an agent makes is built here, together with the
//! output budget it runs under.

use crate::guesser::Strategy;
use crate::reasoning::Prompt;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use twenty_core::{LogEntry, PlayerId, Rules};

pub const OBJECT_TOKENS: u32 = 20;
pub const DESCRIPTION_TOKENS: u32 = 300;
pub const ANSWER_TOKENS: u32 = 10;
pub const CHECK_TOKENS: u32 = 5;
pub const DECISION_TOKENS: u32 = 10;
pub const QUESTION_TOKENS: u32 = 30;
pub const GUESS_TOKENS: u32 = 20;
pub const TRANSLATE_TOKENS: u32 = 200;

const EXAMPLE_SETS: [[&str; 4]; 5] = [
    ["apple", "car", "book", "cat"],
    ["ball", "tree", "spoon", "dog"],
    ["shoe", "bicycle", "door", "fish"],
    ["cup", "bird", "chair", "cake"],
    ["hat", "bus", "lamp", "bear"],
];

const FOCUS_AREAS: [&str; 5] = [
    "Think about objects from around the house, school, or outside",
    "Consider things children play with, eat, or use daily",
    "Focus on animals, plants, or natural objects kids see often",
    "Think of vehicles, furniture, or things that move",
    "Consider food, toys, or colorful objects children love",
];

const CATEGORIES: [&str; 13] = [
    "fruits",
    "vegetables",
    "animals",
    "toys",
    "school supplies",
    "sports equipment",
    "household items",
    "vehicles",
    "foods",
    "clothing",
    "nature objects",
    "furniture",
    "tools",
];

/// Object selection, varied per call so repeated rounds differ
pub fn choose_object(rules: &Rules, rng: &mut impl Rng) -> Prompt {
    let examples = EXAMPLE_SETS[rng.gen_range(0..EXAMPLE_SETS.len())]
        .iter()
        .map(|e| format!("'{}'", e))
        .collect::<Vec<_>>()
        .join(", ");
    let focus = FOCUS_AREAS[rng.gen_range(0..FOCUS_AREAS.len())];
    let categories = CATEGORIES
        .choose_multiple(rng, 6)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    let game_no: u32 = rng.gen_range(0..1000);

    Prompt::new(
        format!(
            "You are playing a guessing game with {}. {}. You MUST respond with exactly ONE \
             ENGLISH WORD only. BE CREATIVE AND VARIED - avoid repeating previous choices!",
            rules.target_audience, rules.principle
        ),
        format!(
            "Game #{}: Choose ONE object for a guessing game with {}. {}. Consider: {}. {} \
             Respond with ONLY a SINGLE ENGLISH WORD - no phrases, no compound words, just one \
             simple English word like {}. {}",
            game_no,
            rules.target_audience,
            focus,
            categories,
            rules.requirement,
            examples,
            rules.language
        ),
    )
}

/// Property sheet the thinker answers from
pub fn describe_object(object: &str) -> Prompt {
    Prompt::new(
        "You are an expert on objects and their properties. Provide comprehensive information \
         about the given object to help answer yes/no questions accurately.",
        format!(
            "Describe the key properties of a '{}' that would be relevant for a guessing game. \
             Include: size, color, material, living/non-living, location typically found, \
             function, sounds it makes, etc. Keep it factual and child-appropriate.",
            object
        ),
    )
}

pub fn answer_question(object: &str, description: &str, question: &str) -> Prompt {
    Prompt::new(
        format!(
            "You are playing a guessing game with children in English. You have chosen the \
             object '{}' - something every child would know. Answer questions accurately from a \
             child's perspective. You MUST respond with ONLY 'yes' or 'no' in English - NO OTHER \
             WORDS.\n\nObject context: {}",
            object, description
        ),
        format!(
            "Question about '{}': {}\n\nThink like a child would understand this object. Answer \
             with ONLY 'yes' or 'no' in English.",
            object, question
        ),
    )
}

pub fn check_guess(object: &str, guess: &str) -> Prompt {
    Prompt::new(
        format!(
            "You are checking if a guess matches the secret object '{}'. Consider synonyms, \
             plural/singular forms, and reasonable variations. Be generous with matches.",
            object
        ),
        format!(
            "Does the guess '{}' match semantically the object '{}'? Answer only 'yes' or 'no'.",
            guess, object
        ),
    )
}

/// Progress figures a guesser reasons over
#[derive(Debug, Clone, Copy)]
pub struct Standing {
    pub questions_asked: u32,
    pub max_questions: u32,
    pub guesses_used: u32,
    pub max_guesses: u32,
}

pub fn decide(me: &PlayerId, strategy: Strategy, standing: Standing, memory: &[LogEntry]) -> Prompt {
    Prompt::new(
        format!(
            "You are {}, a {} guesser in a COMPETITIVE guessing game. This is a RACE - your goal \
             is to be the FIRST to correctly guess the mystery object and WIN before the other \
             players do! You have exactly {} guesses maximum. Use them wisely to beat your \
             opponents!",
            me, strategy, standing.max_guesses
        ),
        format!(
            "COMPETITIVE GAME STATUS:\n- Questions asked by all players: {}/{}\n- YOUR guesses \
             used: {}/{}\n- Recent Q&A:\n{}\n\nShould you make a guess now to try to WIN, or ask \
             another question first? If you're confident, GUESS to win! If you need more info, \
             ask a QUESTION. Answer only 'GUESS' or 'QUESTION'.",
            standing.questions_asked,
            standing.max_questions,
            standing.guesses_used,
            standing.max_guesses,
            qa_lines(memory, 10, "No questions asked yet.")
        ),
    )
}

pub fn ask_question(strategy: Strategy, max_guesses: u32, memory: &[LogEntry]) -> Prompt {
    let guidance = match strategy {
        Strategy::Systematic => {
            "You ask logical, methodical questions to systematically narrow down possibilities. \
             Start with broad categories (living/non-living, size, etc.) then get more specific. \
             Be efficient - this is a competitive race!"
        }
        Strategy::Creative => {
            "You ask imaginative, fun questions that think outside the box. You consider how \
             objects make people feel, their cultural significance, and creative associations. \
             Use creativity to get insights others might miss!"
        }
        Strategy::Random => {
            "You ask varied questions from different angles, sometimes surprising others with \
             unexpected approaches. You're spontaneous and unpredictable. Keep opponents guessing \
             your strategy!"
        }
    };

    Prompt::new(
        format!(
            "You are in a COMPETITIVE guessing game race with other players! The mystery object \
             is something every child would know from their daily life. You need to be the FIRST \
             to guess correctly and WIN! You have exactly {} guesses maximum - use them \
             strategically.\n\nYour strategy: {}",
            max_guesses, guidance
        ),
        format!(
            "GAME SITUATION:\n{}\n\nAsk a strategic yes/no question IN ENGLISH to help you win! \
             Ask only the question, as a properly formed English sentence that children would \
             understand.",
            qa_lines(memory, 8, "No questions asked yet.")
        ),
    )
}

pub fn make_guess(me: &PlayerId, strategy: Strategy, standing: Standing, memory: &[LogEntry]) -> Prompt {
    let guidance = match strategy {
        Strategy::Systematic => {
            "Analyze clues methodically and logically to deduce the most likely object."
        }
        Strategy::Creative => "Think imaginatively and consider unique objects that fit the clues.",
        Strategy::Random => "Consider various possibilities and make an intuitive guess.",
    };

    let mut wrong = BTreeSet::new();
    let mut others_wrong = BTreeSet::new();
    for entry in memory {
        if let LogEntry::Guess {
            guesser,
            guess,
            correct: false,
        } = entry
        {
            wrong.insert(guess.as_str());
            if guesser != me {
                others_wrong.insert(guess.as_str());
            }
        }
    }

    let mut ruled_out = String::new();
    if !wrong.is_empty() {
        ruled_out.push_str(&format!(
            "\n\nIMPORTANT - These guesses have already been tried and are WRONG (DO NOT repeat \
             ANY of these):\n{}",
            wrong.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }
    if !others_wrong.is_empty() {
        ruled_out.push_str(&format!(
            "\n\nOther players already guessed wrong: {} - Learn from their mistakes!",
            others_wrong.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    Prompt::new(
        format!(
            "You are {} in a COMPETITIVE RACE to guess the mystery object FIRST and WIN! This is \
             guess #{}/{}. The object is something every child would know. NEVER repeat a wrong \
             guess!\n\nYour strategy: {}",
            me,
            standing.guesses_used + 1,
            standing.max_guesses,
            guidance
        ),
        format!(
            "All the clues gathered by everyone:\n{}{}\n\nWhat object fits ALL the clues and \
             hasn't been guessed wrong yet? Respond with only the English word for the object.",
            qa_lines(memory, usize::MAX, "No information available."),
            ruled_out
        ),
    )
}

pub fn translate(language: &str, text: &str) -> Prompt {
    Prompt::new(
        format!(
            "You are a professional English to {0} translator. Translate the given text \
             naturally and accurately to {0}. Respond with ONLY the {0} translation - no \
             explanations or additional text.",
            language
        ),
        format!(
            "Translate to {0}:\n\n{1}\n\nProvide only the {0} translation.",
            language, text
        ),
    )
}

/// `Q: … A: …` lines from the last `window` memory entries
fn qa_lines(memory: &[LogEntry], window: usize, empty: &str) -> String {
    let start = memory.len().saturating_sub(window);
    let lines: Vec<String> = memory[start..]
        .iter()
        .filter_map(|entry| match entry {
            LogEntry::Question {
                question, answer, ..
            } => Some(format!("Q: {} A: {}", question, answer)),
            LogEntry::Guess { .. } => None,
        })
        .collect();

    if lines.is_empty() {
        empty.to_string()
    } else {
        lines.join("\n")
    }
}
