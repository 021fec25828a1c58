//! Wiring of the default steps into a workflow graph.

use std::sync::Arc;

use pipeline_engine::{
    CompletionOptions, CompletionService, ExtractionService, QueryBackend, WorkflowSteps,
};

use crate::{
    InterpretationValidator, Interpreter, PlanRouter, Planner, QueryGenerator, QueryRunner,
    QueryValidator, Responder,
};

/// Collaborators shared by the default steps.
#[derive(Clone)]
pub struct StepCollaborators {
    pub completion: Arc<dyn CompletionService>,
    pub extraction: Arc<dyn ExtractionService>,
    pub query_backend: Arc<dyn QueryBackend>,
    pub options: CompletionOptions,
}

/// Build the default step for every stage of the graph.
pub fn default_steps(collaborators: &StepCollaborators) -> WorkflowSteps {
    let c = collaborators;
    WorkflowSteps {
        planner: Arc::new(Planner::new(c.extraction.clone(), c.options.clone())),
        router: Arc::new(PlanRouter::new()),
        query_generator: Arc::new(QueryGenerator::new(c.completion.clone(), c.options.clone())),
        query_validator: Arc::new(QueryValidator::new(c.extraction.clone(), c.options.clone())),
        query_executor: Arc::new(QueryRunner::new(c.query_backend.clone())),
        interpreter: Arc::new(Interpreter::new(c.completion.clone(), c.options.clone())),
        interpretation_validator: Arc::new(InterpretationValidator::new(
            c.extraction.clone(),
            c.options.clone(),
        )),
        responder: Arc::new(Responder::new(c.completion.clone(), c.options.clone())),
    }
}
