//! Structured artifacts extracted from finished generations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ParseError;
use crate::processor::{ProcessedSection, SectionKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Artifact {
    Report(Report),
    Plan(ImplementationPlan),
}

/// Analysis or strategy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub title: String,
    pub sections: Vec<ReportSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    #[serde(default)]
    pub overview: String,
    pub phases: Vec<PlanPhase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub title: String,
    #[serde(default)]
    pub tasks: Vec<String>,
}

impl ImplementationPlan {
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }
}

/// Turns the final buffer of a session into an [`Artifact`]
pub trait ArtifactParser: Send + Sync + fmt::Debug {
    fn parse(&self, raw: &str, sections: &[ProcessedSection]) -> Result<Artifact, ParseError>;
}

/// Which parser a feature uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Report,
    Plan,
}

impl ArtifactKind {
    pub fn parser(self) -> Arc<dyn ArtifactParser> {
        match self {
            ArtifactKind::Report => Arc::new(ReportParser),
            ArtifactKind::Plan => Arc::new(PlanParser),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportParser;

impl ArtifactParser for ReportParser {
    fn parse(&self, raw: &str, sections: &[ProcessedSection]) -> Result<Artifact, ParseError> {
        if raw.trim().is_empty() {
            return Err(ParseError::EmptyOutput);
        }

        let titled: Vec<&ProcessedSection> = sections
            .iter()
            .filter(|s| s.level > 0 && !s.title.is_empty())
            .collect();

        let title = titled
            .iter()
            .find(|s| s.level == 1)
            .or_else(|| titled.first())
            .map(|s| s.title.clone())
            .ok_or(ParseError::NoSections)?;

        let sections: Vec<ReportSection> = titled
            .into_iter()
            .filter(|s| !s.content.is_empty())
            .map(|s| ReportSection {
                title: s.title.clone(),
                content: s.content.clone(),
            })
            .collect();

        if sections.is_empty() {
            return Err(ParseError::NoSections);
        }

        Ok(Artifact::Report(Report { title, sections }))
    }
}

/// Implementation plan extraction
///
/// A fenced ```json block holding a complete plan wins. Otherwise every
/// phase-like section becomes a phase whose tasks are its list items.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanParser;

impl ArtifactParser for PlanParser {
    fn parse(&self, raw: &str, sections: &[ProcessedSection]) -> Result<Artifact, ParseError> {
        if raw.trim().is_empty() {
            return Err(ParseError::EmptyOutput);
        }

        if let Some(plan) = json_block(raw)
            .and_then(|block| serde_json::from_str::<ImplementationPlan>(&block).ok())
            .filter(|plan| plan.task_count() > 0)
        {
            return Ok(Artifact::Plan(plan));
        }

        let phases: Vec<PlanPhase> = sections
            .iter()
            .filter(|s| s.level > 0 && s.kind == SectionKind::Phases)
            .map(|s| PlanPhase {
                title: s.title.clone(),
                tasks: list_items(&s.content),
            })
            .filter(|phase| !phase.tasks.is_empty())
            .collect();

        if phases.is_empty() {
            return Err(ParseError::NoPhases);
        }

        let overview = sections
            .iter()
            .find(|s| s.kind == SectionKind::Overview && s.level > 0)
            .or_else(|| sections.iter().find(|s| s.level == 0))
            .map(|s| s.content.clone())
            .unwrap_or_default();

        Ok(Artifact::Plan(ImplementationPlan { overview, phases }))
    }
}

/// Body of the first ```json fence
fn json_block(raw: &str) -> Option<String> {
    let mut lines = raw.lines();
    lines.find(|line| line.trim_start().starts_with("```json"))?;

    let mut body = String::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            return Some(body);
        }
        body.push_str(line);
        body.push('\n');
    }
    None
}

/// Bulleted (`-`, `*`, `+`) and numbered (`1.`, `1)`) list items
fn list_items(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| line.strip_prefix("+ "))
                .or_else(|| {
                    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
                    if digits == 0 {
                        return None;
                    }
                    line[digits..]
                        .strip_prefix(". ")
                        .or_else(|| line[digits..].strip_prefix(") "))
                })?;
            let item = rest.trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::IncrementalContentProcessor;

    fn parse_with(parser: &dyn ArtifactParser, raw: &str) -> Result<Artifact, ParseError> {
        let mut processor = IncrementalContentProcessor::default();
        processor.process_chunk(raw);
        parser.parse(raw, &processor.sections())
    }

    #[test]
    fn test_report() {
        let raw = "# Acme Analysis\nStrong team.\n## Market\nGrowing.\n## Empty\n";
        let Artifact::Report(report) = parse_with(&ReportParser, raw).unwrap() else {
            panic!("expected report");
        };

        assert_eq!(report.title, "Acme Analysis");
        let titles: Vec<_> = report.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Acme Analysis", "Market"]);
    }

    #[test]
    fn test_report_rejects_unstructured_text() {
        assert_eq!(parse_with(&ReportParser, "just prose"), Err(ParseError::NoSections));
        assert_eq!(parse_with(&ReportParser, "  \n"), Err(ParseError::EmptyOutput));
    }

    #[test]
    fn test_plan_from_headings() {
        let raw = "## Overview\nLaunch in EU.\n\
## Phase 1: Research\n- Interview customers\n- Size the market\n\
## Phase 2: Pilot\n1. Sign two partners\n2) Run a webinar\n\
## Risks\n- Currency\n";
        let Artifact::Plan(plan) = parse_with(&PlanParser, raw).unwrap() else {
            panic!("expected plan");
        };

        assert_eq!(plan.overview, "Launch in EU.");
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].tasks, vec!["Interview customers", "Size the market"]);
        assert_eq!(plan.phases[1].tasks, vec!["Sign two partners", "Run a webinar"]);
    }

    #[test]
    fn test_plan_prefers_json_block() {
        let raw = "## Phase 1\n- ignored\n\n```json\n\
{\"overview\": \"From JSON\", \"phases\": [{\"title\": \"Build\", \"tasks\": [\"Ship\"]}]}\n\
```\n";
        let Artifact::Plan(plan) = parse_with(&PlanParser, raw).unwrap() else {
            panic!("expected plan");
        };

        assert_eq!(plan.overview, "From JSON");
        assert_eq!(plan.phases[0].title, "Build");
    }

    #[test]
    fn test_plan_without_tasks_fails() {
        let raw = "## Phase 1\nSome words but no list.\n";
        assert_eq!(parse_with(&PlanParser, raw), Err(ParseError::NoPhases));
    }

    #[test]
    fn test_artifact_serialization_tag() {
        let artifact = Artifact::Plan(ImplementationPlan {
            overview: String::new(),
            phases: vec![],
        });
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["type"], "plan");
    }

    #[test]
    fn test_list_items() {
        let items = list_items("- a\n* b\n+ c\n10. d\n3) e\n-not\n12 f\n- \n");
        assert_eq!(items, vec!["a", "b", "c", "d", "e"]);
    }
}
