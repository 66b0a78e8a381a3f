use std::sync::LazyLock;

use regex::Regex;

use crate::core::domain::{ComplexityEstimate, RunSummary, SpaceClass, TimeClass};

/// Upper bounds (inclusive) of average per-case wall time, in milliseconds.
const TIME_THRESHOLDS: [(f64, TimeClass); 5] = [
    (10.0, TimeClass::Constant),
    (50.0, TimeClass::Logarithmic),
    (200.0, TimeClass::Linear),
    (500.0, TimeClass::Linearithmic),
    (2000.0, TimeClass::Quadratic),
];

/// Upper bounds (inclusive) of peak memory, in megabytes.
const SPACE_THRESHOLDS: [(f64, SpaceClass); 3] = [
    (16.0, SpaceClass::Constant),
    (64.0, SpaceClass::Linear),
    (256.0, SpaceClass::Quadratic),
];

const MINIMAL: ComplexityEstimate = ComplexityEstimate {
    time_class: TimeClass::Constant,
    space_class: SpaceClass::Constant,
};

static LOOP_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:for|while|do)\b").expect("valid loop regex"));
static PYTHON_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:def|for|while|if|elif|else|class|try|with)\b.*:\s*$")
        .expect("valid python block regex")
});
static PYTHON_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*def\s+(\w+)\s*\(").expect("valid def regex"));
static C_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[\w:<>,\*&\[\]]+\s+)+[\*&]?(\w+)\s*\([^;]*$")
        .expect("valid function header regex")
});
static SORT_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sort|sorted|qsort|stable_sort|sort_by|sort_unstable)\s*\(")
        .expect("valid sort regex")
});
static HALVING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?://=\s*2\b|/=\s*2\b|>>=\s*1\b|\*=\s*2\b)").expect("valid halving regex")
});
static ALLOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:list|dict|set)\s*\(|\b(?:vector|map|set|unordered_map|unordered_set|deque)\s*<|\b(?:malloc|new)\b|\.(?:append|push_back|emplace_back|insert)\(|=\s*\[",
    )
    .expect("valid allocation regex")
});

const NOT_FUNCTIONS: [&str; 7] = ["if", "for", "while", "switch", "return", "catch", "sizeof"];

/// Classifies a run by its average per-case time and peak memory. An
/// advisory label only, scoring never reads it.
pub fn estimate(run: &RunSummary) -> ComplexityEstimate {
    if run.total_count == 0 {
        return MINIMAL;
    }

    ComplexityEstimate {
        time_class: classify(run.avg_time_ms, &TIME_THRESHOLDS, TimeClass::Exponential),
        space_class: classify(run.max_memory_mb, &SPACE_THRESHOLDS, SpaceClass::Cubic),
    }
}

fn classify<C: Copy>(value: f64, thresholds: &[(f64, C)], largest: C) -> C {
    if !value.is_finite() || value <= 0.0 {
        return thresholds[0].1;
    }
    thresholds
        .iter()
        .find(|(bound, _)| value <= *bound)
        .map_or(largest, |(_, class)| *class)
}

/// Structural estimate from loop nesting, self-recursion, sort calls and
/// collection allocations. Works on indentation-structured and brace
/// languages alike and never fails; unrecognised code yields the minimal
/// classes.
pub fn estimate_source(code: &str) -> ComplexityEstimate {
    let lines = significant_lines(code);
    if lines.is_empty() {
        return MINIMAL;
    }

    let indented = PYTHON_BLOCK.is_match(code);
    let shape = if indented {
        scan_indented(&lines)
    } else {
        scan_braced(&lines)
    };
    let recursive = if indented {
        has_recursion_indented(&lines)
    } else {
        has_recursion_braced(&lines)
    };
    let sorts = lines.iter().any(|l| SORT_CALL.is_match(l.text));
    let halves = lines.iter().any(|l| HALVING.is_match(l.text));

    let time_class = if recursive {
        TimeClass::Exponential
    } else {
        match shape.max_nesting {
            0 if sorts => TimeClass::Linearithmic,
            0 => TimeClass::Constant,
            1 if sorts => TimeClass::Linearithmic,
            1 if halves && shape.loop_count == 1 => TimeClass::Logarithmic,
            1 => TimeClass::Linear,
            _ => TimeClass::Quadratic,
        }
    };

    let space_class = match shape.allocation_nesting {
        Some(0) | Some(1) => SpaceClass::Linear,
        Some(2) => SpaceClass::Quadratic,
        Some(_) => SpaceClass::Cubic,
        None if recursive => SpaceClass::Linear,
        None => SpaceClass::Constant,
    };

    ComplexityEstimate {
        time_class,
        space_class,
    }
}

#[derive(Debug)]
struct Line<'a> {
    indent: usize,
    text: &'a str,
}

#[derive(Debug, Default)]
struct Shape {
    max_nesting: usize,
    loop_count: usize,
    /// Deepest loop nesting at which a collection is allocated.
    allocation_nesting: Option<usize>,
}

impl Shape {
    fn record_line(&mut self, text: &str, nesting: usize) {
        if ALLOCATION.is_match(text) {
            self.allocation_nesting =
                Some(self.allocation_nesting.map_or(nesting, |n| n.max(nesting)));
        }
    }
}

fn significant_lines(code: &str) -> Vec<Line<'_>> {
    code.lines()
        .filter_map(|raw| {
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') || text.starts_with("//") {
                return None;
            }
            let text = match text.find("//") {
                Some(pos) => text[..pos].trim_end(),
                None => text,
            };
            let indent = raw.len() - raw.trim_start().len();
            Some(Line { indent, text })
        })
        .collect()
}

fn scan_indented(lines: &[Line]) -> Shape {
    let mut shape = Shape::default();
    let mut open_loops: Vec<usize> = Vec::new();

    for line in lines {
        while open_loops.last().is_some_and(|&indent| indent >= line.indent) {
            open_loops.pop();
        }
        shape.record_line(line.text, open_loops.len());
        if LOOP_HEADER.is_match(line.text) {
            open_loops.push(line.indent);
            shape.loop_count += 1;
            shape.max_nesting = shape.max_nesting.max(open_loops.len());
        }
    }

    shape
}

#[derive(Debug)]
struct BraceLoop {
    depth: usize,
    opened: bool,
    header_line: usize,
}

fn scan_braced(lines: &[Line]) -> Shape {
    let mut shape = Shape::default();
    let mut open_loops: Vec<BraceLoop> = Vec::new();
    let mut depth = 0usize;

    for (idx, line) in lines.iter().enumerate() {
        shape.record_line(line.text, open_loops.len());

        if LOOP_HEADER.is_match(line.text) {
            open_loops.push(BraceLoop {
                depth,
                opened: false,
                header_line: idx,
            });
            shape.loop_count += 1;
            shape.max_nesting = shape.max_nesting.max(open_loops.len());
        }

        for ch in line.text.chars() {
            match ch {
                '{' => {
                    if let Some(top) = open_loops.last_mut() {
                        if !top.opened && top.depth == depth {
                            top.opened = true;
                        }
                    }
                    depth += 1;
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    while open_loops.last().is_some_and(|l| l.opened && l.depth >= depth) {
                        open_loops.pop();
                    }
                }
                _ => {}
            }
        }

        // Brace-less bodies span a single statement.
        if let Some(top) = open_loops.last() {
            if !top.opened && top.header_line == idx && line.text.ends_with(';') {
                open_loops.pop();
            }
        }
        while open_loops
            .last()
            .is_some_and(|l| !l.opened && l.header_line < idx)
        {
            open_loops.pop();
        }
    }

    shape
}

fn calls_itself(name: &str, body: &str) -> bool {
    Regex::new(&format!(r"\b{}\s*\(", regex::escape(name)))
        .map(|call| call.is_match(body))
        .unwrap_or(false)
}

fn has_recursion_indented(lines: &[Line]) -> bool {
    lines.iter().enumerate().any(|(idx, line)| {
        let Some(captures) = PYTHON_DEF.captures(line.text) else {
            return false;
        };
        let name = &captures[1];
        let inline_body = line.text.split_once("):").map_or("", |(_, body)| body);

        calls_itself(name, inline_body)
            || lines[idx + 1..]
                .iter()
                .take_while(|body| body.indent > line.indent)
                .any(|body| calls_itself(name, body.text))
    })
}

fn has_recursion_braced(lines: &[Line]) -> bool {
    lines.iter().enumerate().any(|(idx, line)| {
        let Some(captures) = C_FUNCTION.captures(line.text) else {
            return false;
        };
        let name = &captures[1];
        if NOT_FUNCTIONS.contains(&name) {
            return false;
        }
        calls_itself(name, &braced_body(&lines[idx..]))
    })
}

/// Text between the first `{` and its matching `}`.
fn braced_body(lines: &[Line]) -> String {
    let mut body = String::new();
    let mut depth = 0usize;
    let mut started = false;

    for line in lines {
        for ch in line.text.chars() {
            match ch {
                '{' => {
                    if started {
                        body.push(ch);
                    }
                    started = true;
                    depth += 1;
                }
                '}' if started => {
                    depth -= 1;
                    if depth == 0 {
                        return body;
                    }
                    body.push(ch);
                }
                ';' if !started => return body,
                _ if started => body.push(ch),
                _ => {}
            }
        }
        if started {
            body.push('\n');
        }
    }

    body
}
