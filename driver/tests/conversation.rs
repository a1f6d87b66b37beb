//! Conversation loop against a scripted agent, with real filesystem effects.

use driver::batch::BatchExecutor;
use driver::conversation::{ConversationController, ConversationStop};
use driver::io::dispatcher::ActionDispatcher;
use driver::test_support::{ScriptedAgent, ScriptedRunner, TestProject};
use serde_json::{Value, json};

#[test]
fn each_executed_step_is_logged_and_fed_back() {
    let project = TestProject::new().expect("project");
    project.write_file("PROMPT.md", "You run a strategy lab.").expect("prompt");
    let config = project.config();

    let agent = ScriptedAgent::new(vec![
        Ok(vec![json!({
            "type": "write_file",
            "path": "strategies/breakout.py",
            "content": "def run_strategy(df):\n    return df, {}\n",
        })]),
        Ok(vec![
            json!({"type": "list_dir", "path": "strategies"}),
            json!({"type": "run_command", "command": "python engine/backtest.py strategies/breakout.py"}),
        ]),
        Ok(Vec::new()),
    ]);
    let runner = ScriptedRunner::new(vec![ScriptedRunner::exit(0, "total_return: 0.12\n", "")]);
    let batch = BatchExecutor::new(ActionDispatcher::new(project.root(), config.sandbox.clone(), runner));
    let mut controller =
        ConversationController::new(project.root(), &config, agent, batch).expect("controller");

    let mut steps = Vec::new();
    let outcome = controller.run(|step| steps.push(step.clone())).expect("run");

    assert_eq!(outcome.stop, ConversationStop::NoActions);
    assert_eq!(outcome.steps_executed, 2);
    assert!(outcome.log_dir.starts_with(project.root().join("logs")));
    assert!(project.root().join("strategies/breakout.py").is_file());

    let second: Value = serde_json::from_str(
        &std::fs::read_to_string(outcome.log_dir.join("agent_step_2.json")).expect("step log"),
    )
    .expect("json");
    assert_eq!(second["step"], 2);
    assert_eq!(second["results"][0]["items"], json!(["breakout.py"]));
    assert_eq!(second["results"][1]["stdout"], "total_return: 0.12\n");
    assert!(!outcome.log_dir.join("agent_step_3.json").exists());

    let seen = controller.agent().seen();
    assert_eq!(seen.len(), 3);
    let last_user = &seen[2].last().expect("user message").content;
    assert!(last_user.contains("total_return: 0.12"));
}
