//! Deterministic keyword-based planning.

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    format_inputs, UserInputs, Workflow, WorkflowError, WorkflowGenerator, WorkflowSource,
    MAX_DEPENDENCY_TASKS, MAX_IMMEDIATE_TASKS,
};
use crate::store::{Priority, Task};

struct Rule {
    keywords: &'static [&'static str],
    immediate: &'static [(&'static str, &'static str)],
    /// (title, blocked reason)
    dependencies: &'static [(&'static str, &'static str)],
}

const RULES: &[Rule] = &[
    Rule {
        keywords: &["email", "newsletter", "outreach", "campaign"],
        immediate: &[
            ("Draft email copy", "Write the subject line and body for the message"),
            ("Build recipient list", "Collect and segment the people who should receive it"),
        ],
        dependencies: &[(
            "Approve email before sending",
            "Sending email on your behalf needs your approval",
        )],
    },
    Rule {
        keywords: &["blog", "article", "content", "post", "write"],
        immediate: &[
            ("Outline the content", "List the sections and key points to cover"),
            ("Write first draft", "Turn the outline into a complete draft"),
        ],
        dependencies: &[(
            "Review draft before publishing",
            "Publishing needs your review of the final draft",
        )],
    },
    Rule {
        keywords: &["research", "analy", "market", "competitor", "report"],
        immediate: &[
            ("Gather sources", "Find relevant, current sources on the topic"),
            ("Summarize findings", "Condense the sources into key takeaways"),
        ],
        dependencies: &[],
    },
    Rule {
        keywords: &["social", "twitter", "linkedin", "instagram"],
        immediate: &[("Draft social posts", "Write a short batch of posts for review")],
        dependencies: &[(
            "Connect social account",
            "Posting requires access to your social account",
        )],
    },
    Rule {
        keywords: &["sales", "lead", "prospect", "crm"],
        immediate: &[("Identify target leads", "Describe the ideal customer and list candidates")],
        dependencies: &[("Provide CRM access", "Updating your pipeline requires CRM access")],
    },
];

const GENERIC_IMMEDIATE: &[(&str, &str)] = &[
    ("Break the goal into steps", "Split the goal into concrete, ordered steps"),
    ("Research background", "Collect the context needed to start on the goal"),
];

const GENERIC_DEPENDENCY: (&str, &str) = (
    "Confirm goal and success criteria",
    "The plan needs your confirmation before work continues",
);

/// Plans from keywords in the goal; no network access.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedGenerator;

impl RuleBasedGenerator {
    fn plan(agent_id: Uuid, user_id: Uuid, goal: &str, user_inputs: &UserInputs) -> Workflow {
        let lowered = goal.to_lowercase();
        let matched: Vec<&Rule> = RULES
            .iter()
            .filter(|r| r.keywords.iter().any(|k| lowered.contains(k)))
            .collect();

        let inputs = format_inputs(user_inputs);
        let describe = |base: &str| {
            let mut d = format!("{}. Goal: {}", base, goal);
            if !inputs.is_empty() {
                d.push_str("\n\n");
                d.push_str(&inputs);
            }
            d
        };

        let immediate_specs: Vec<(&str, &str)> = if matched.is_empty() {
            GENERIC_IMMEDIATE.to_vec()
        } else {
            matched.iter().flat_map(|r| r.immediate.iter().copied()).collect()
        };
        let mut dependency_specs: Vec<(&str, &str)> =
            matched.iter().flat_map(|r| r.dependencies.iter().copied()).collect();
        if dependency_specs.is_empty() {
            dependency_specs.push(GENERIC_DEPENDENCY);
        }

        let mut immediate: Vec<Task> = Vec::new();
        for (i, (title, base)) in immediate_specs.into_iter().enumerate() {
            if immediate.len() == MAX_IMMEDIATE_TASKS {
                break;
            }
            if immediate.iter().any(|t| t.title == title) {
                continue;
            }
            // The first step of a plan goes first.
            let priority = if i == 0 { Priority::High } else { Priority::Medium };
            immediate.push(Task::actionable(agent_id, user_id, title, describe(base), priority));
        }

        let mut dependencies: Vec<Task> = Vec::new();
        for (title, reason) in dependency_specs {
            if dependencies.len() == MAX_DEPENDENCY_TASKS {
                break;
            }
            if dependencies.iter().any(|t| t.title == title) {
                continue;
            }
            dependencies.push(Task::human_blocked(
                agent_id,
                user_id,
                title,
                describe(reason),
                reason,
            ));
        }

        Workflow::new(immediate, dependencies, WorkflowSource::Rules)
    }
}

#[async_trait]
impl WorkflowGenerator for RuleBasedGenerator {
    async fn generate(
        &self,
        agent_id: Uuid,
        user_id: Uuid,
        goal: &str,
        user_inputs: &UserInputs,
    ) -> Result<Workflow, WorkflowError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(WorkflowError::EmptyGoal);
        }
        let workflow = Self::plan(agent_id, user_id, goal, user_inputs);
        tracing::debug!(
            agent_id = %agent_id,
            immediate = workflow.immediate_tasks.len(),
            dependencies = workflow.dependency_tasks.len(),
            "Generated rule-based workflow"
        );
        Ok(workflow)
    }
}
