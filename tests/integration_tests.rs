//! Integration tests for the Smithers engine.
//!
//! These drive full workflows through the public API: loops, phases, steps,
//! parallel groups, human gates, commands, agents, and the inspection CLI.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use smithers::adapters::ScriptedAgent;
use smithers::elements::{
    Agent, Command, Condition, End, Human, If, Parallel, Phase, Ralph, Step, Switch, While,
};
use smithers::engine::request_stop;
use smithers::tree::Element;
use smithers::{Engine, EngineOptions, Store};
use smithers_common::{AgentAdapter, CompletionReason, HumanStatus};

/// Run a future on a current-thread runtime inside a LocalSet, which is the
/// engine's native habitat.
fn block_on_local<F: Future>(fut: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(fut))
}

fn memory_engine() -> (Rc<Store>, Engine) {
    let store = Rc::new(Store::open_in_memory().unwrap());
    let engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
    (store, engine)
}

fn phase_with_command(name: &str) -> Element {
    Phase::new(name)
        .child(
            Step::named(format!("{}-work", name))
                .child(Command::argv(vec!["true".into()]).into_element())
                .into_element(),
        )
        .into_element()
}

fn get_state<T: serde::de::DeserializeOwned>(store: &Store, key: &str) -> Option<T> {
    store.state().get(key).unwrap()
}

// =============================================================================
// Scenario: three sequential phases in a single-iteration loop
// =============================================================================

mod sequential_phases {
    use super::*;

    #[test]
    fn three_phases_complete_in_order() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let completions: Rc<RefCell<Vec<(u64, CompletionReason)>>> =
                Rc::new(RefCell::new(Vec::new()));
            let completions_cb = Rc::clone(&completions);

            let tree = While::new("L")
                .condition(Condition::always())
                .max_iterations(1)
                .on_complete(move |iterations, reason| {
                    completions_cb.borrow_mut().push((iterations, reason));
                })
                .child(phase_with_command("A"))
                .child(phase_with_command("B"))
                .child(phase_with_command("C"))
                .into_element();

            engine.render(tree);
            engine.run_until_settled().await;

            // Phase rows in order, all completed, all at iteration 0.
            let phases = store.phases().list().unwrap();
            let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
            assert_eq!(names, vec!["A", "B", "C"]);
            for phase in &phases {
                assert_eq!(phase.status, "completed", "phase {}", phase.name);
                assert_eq!(phase.iteration, 0);
            }

            // All three steps completed, with no mirrored errors.
            let steps = store.steps().list().unwrap();
            assert_eq!(steps.len(), 3);
            for step in &steps {
                assert_eq!(step.status, "completed", "step {}", step.name);
                assert_eq!(step.error, None);
            }

            // Three units of real work, all terminal.
            assert_eq!(store.tasks().total_count(0).unwrap(), 3);
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);

            // Loop bookkeeping.
            assert_eq!(get_state::<u64>(&store, "ralphCount"), Some(0));
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
            assert_eq!(
                *completions.borrow(),
                vec![(1, CompletionReason::Max)]
            );
        });
    }

    #[test]
    fn phase_cursor_is_monotonic_within_the_iteration() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(
                Ralph::new("L", 1)
                    .child(phase_with_command("A"))
                    .child(phase_with_command("B"))
                    .into_element(),
            );
            engine.run_until_settled().await;

            let history = store.state().history("currentPhaseIndex", 50).unwrap();
            // Newest first; reverse into chronological order and check the
            // cursor never decreased.
            let values: Vec<u64> = history
                .iter()
                .rev()
                .filter_map(|e| e.new_value.as_ref().and_then(|v| v.as_u64()))
                .collect();
            for pair in values.windows(2) {
                assert!(pair[1] >= pair[0], "cursor decreased: {:?}", values);
            }
            assert_eq!(values.last(), Some(&2));
        });
    }
}

// =============================================================================
// Scenario: parallel three-step phase
// =============================================================================

mod parallel_steps {
    use super::*;

    #[test]
    fn parallel_steps_all_complete_and_advance_once() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let tree = Ralph::new("L", 1)
                .child(
                    Phase::new("P")
                        .child(
                            Parallel::new()
                                .child(step_with_true("a"))
                                .child(step_with_true("b"))
                                .child(step_with_true("c"))
                                .into_element(),
                        )
                        .into_element(),
                )
                .into_element();

            engine.render(tree);
            engine.run_until_settled().await;

            let steps = store.steps().list().unwrap();
            assert_eq!(steps.len(), 3);
            for step in &steps {
                assert_eq!(step.status, "completed", "step {}", step.name);
            }

            // Per-step completion markers exist.
            let markers = store.state().keys_with_prefix("stepComplete:").unwrap();
            assert_eq!(markers.len(), 3);

            // The phase cursor advanced exactly once, 0 -> 1.
            let advances = store
                .state()
                .history("currentPhaseIndex", 50)
                .unwrap()
                .into_iter()
                .filter(|e| e.reason == "phase advanced")
                .count();
            assert_eq!(advances, 1);
            assert_eq!(get_state::<u64>(&store, "currentPhaseIndex"), Some(1));
        });
    }

    #[test]
    fn parallel_steps_overlap_in_wall_clock_time() {
        block_on_local(async {
            let (_, mut engine) = memory_engine();
            let sleeper = |name: &str| {
                Step::named(name)
                    .child(Command::shell("sleep 0.2").into_element())
                    .into_element()
            };
            let start = Instant::now();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("P")
                            .child(
                                Parallel::new()
                                    .child(sleeper("a"))
                                    .child(sleeper("b"))
                                    .child(sleeper("c"))
                                    .into_element(),
                            )
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            // Roughly max(durations), not the 600ms a serial run would take.
            let elapsed = start.elapsed();
            assert!(
                elapsed < Duration::from_millis(550),
                "parallel steps ran serially: {:?}",
                elapsed
            );
        });
    }

    #[test]
    fn parallel_with_zero_children_advances_the_phase() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("empty")
                            .child(Parallel::new().into_element())
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert_eq!(get_state::<u64>(&store, "currentPhaseIndex"), Some(1));
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
            // No phantom advances.
            let advances = store
                .state()
                .history("currentPhaseIndex", 50)
                .unwrap()
                .into_iter()
                .filter(|e| e.reason == "phase advanced")
                .count();
            assert_eq!(advances, 1);
        });
    }

    fn step_with_true(name: &str) -> Element {
        Step::named(name)
            .child(Command::argv(vec!["true".into()]).into_element())
            .into_element()
    }
}

// =============================================================================
// Scenario: human gate resumes across restart
// =============================================================================

mod human_gate {
    use super::*;

    #[test]
    fn gate_survives_restart_without_duplicating_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("wf.db");

        let tree = || {
            Ralph::new("L", 1)
                .child(
                    Phase::new("approve")
                        .child(Human::new().message("ok?").into_element())
                        .into_element(),
                )
                .into_element()
        };

        // First process: mounts the gate, then "crashes" (no dispose).
        block_on_local(async {
            let store = Rc::new(Store::open(&db_path).unwrap());
            let mut engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
            engine.render(tree());
            engine.run_until_settled().await;

            let pending = store.human().pending().unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].prompt, "ok?");
            let tasks = store.tasks().list(None).unwrap();
            let gates: Vec<_> = tasks
                .iter()
                .filter(|t| t.component_type == "human_interaction")
                .collect();
            assert_eq!(gates.len(), 1);
            assert_eq!(gates[0].status, "running");
            std::mem::forget(engine);
        });

        // Second process: same database, same tree. No second row, no
        // second task; approval completes the phase and the loop.
        block_on_local(async {
            let approved = Rc::new(Cell::new(false));
            let approved_cb = Rc::clone(&approved);
            let store = Rc::new(Store::open(&db_path).unwrap());
            let mut engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("approve")
                            .child(
                                Human::new()
                                    .message("ok?")
                                    .on_approve(move |_| approved_cb.set(true))
                                    .into_element(),
                            )
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            let pending = store.human().pending().unwrap();
            assert_eq!(pending.len(), 1, "resume must not create a second row");
            let gate_tasks = store
                .tasks()
                .list(None)
                .unwrap()
                .into_iter()
                .filter(|t| t.component_type == "human_interaction")
                .count();
            assert_eq!(gate_tasks, 1, "resume must not open a second task");

            // External resolution.
            store
                .human()
                .resolve(&pending[0].id, HumanStatus::Approved, None)
                .unwrap();
            engine.run_until_settled().await;

            assert!(approved.get());
            assert_eq!(store.human().pending().unwrap().len(), 0);
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
        });
    }

    #[test]
    fn content_hash_identity_is_shared_across_mounts() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(Human::new().message("deploy?").into_element());
            engine.run_until_settled().await;

            // Same message twice: one row, one state key.
            engine.render(Human::new().message("deploy?").into_element());
            engine.run_until_settled().await;

            assert_eq!(store.human().pending().unwrap().len(), 1);
            let keys = store.state().keys_with_prefix("human:content:").unwrap();
            assert_eq!(keys.len(), 1);
        });
    }

    #[test]
    fn cancellation_unblocks_without_firing_callbacks() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let approved = Rc::new(Cell::new(false));
            let rejected = Rc::new(Cell::new(false));
            let approved_cb = Rc::clone(&approved);
            let rejected_cb = Rc::clone(&rejected);
            engine.render(
                Human::new()
                    .id("gate")
                    .message("proceed?")
                    .on_approve(move |_| approved_cb.set(true))
                    .on_reject(move |_| rejected_cb.set(true))
                    .into_element(),
            );
            engine.run_until_settled().await;

            let pending = store.human().pending().unwrap();
            store
                .human()
                .resolve(&pending[0].id, HumanStatus::Cancelled, None)
                .unwrap();
            engine.run_until_settled().await;

            assert!(!approved.get());
            assert!(!rejected.get());
            // The blocking task was still released.
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);
        });
    }

    #[test]
    fn approved_gate_renders_its_children() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(
                Human::new()
                    .id("gate")
                    .message("reveal?")
                    .child(Element::text("secret plans"))
                    .into_element(),
            );
            engine.run_until_settled().await;
            assert!(!engine.to_serialized_form().contains("secret plans"));

            let pending = store.human().pending().unwrap();
            store
                .human()
                .resolve(&pending[0].id, HumanStatus::Approved, None)
                .unwrap();
            engine.run_until_settled().await;
            assert!(engine.to_serialized_form().contains("secret plans"));
        });
    }

    #[test]
    fn rejection_fires_on_reject_and_releases_the_task() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let rejected = Rc::new(Cell::new(false));
            let rejected_cb = Rc::clone(&rejected);
            engine.render(
                Human::new()
                    .id("gate")
                    .message("ship?")
                    .on_reject(move |_| rejected_cb.set(true))
                    .into_element(),
            );
            engine.run_until_settled().await;

            let pending = store.human().pending().unwrap();
            store
                .human()
                .resolve(&pending[0].id, HumanStatus::Rejected, None)
                .unwrap();
            engine.run_until_settled().await;

            assert!(rejected.get());
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);
        });
    }
}

// =============================================================================
// Scenario: stop request mid-iteration
// =============================================================================

mod stop_request {
    use super::*;

    #[test]
    fn stop_requested_completes_the_loop_at_the_next_advance() {
        block_on_local(async {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let mut engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
            let completions: Rc<RefCell<Vec<(u64, CompletionReason)>>> =
                Rc::new(RefCell::new(Vec::new()));
            let completions_cb = Rc::clone(&completions);
            let stop_store = Rc::clone(&store);

            engine.render(
                While::new("L")
                    .condition(Condition::always())
                    .max_iterations(5)
                    .on_iteration(move |iteration| {
                        if iteration == 1 {
                            request_stop(&stop_store, "operator asked").unwrap();
                        }
                    })
                    .on_complete(move |iterations, reason| {
                        completions_cb.borrow_mut().push((iterations, reason));
                    })
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert_eq!(
                *completions.borrow(),
                vec![(2, CompletionReason::Condition)]
            );
            assert_eq!(get_state::<u64>(&store, "while.L.iteration"), Some(1));
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
        });
    }
}

// =============================================================================
// Scenario: command timeout inside a step
// =============================================================================

mod command_timeout {
    use super::*;

    #[test]
    fn timeout_fails_the_command_but_not_the_step() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let failure: Rc<RefCell<Option<(i32, bool, u64)>>> = Rc::new(RefCell::new(None));
            let failure_cb = Rc::clone(&failure);

            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("slow")
                            .child(
                                Step::named("timeout-step")
                                    .child(
                                        Command::shell("sleep 10")
                                            .timeout(Duration::from_millis(100))
                                            .on_error(move |result| {
                                                *failure_cb.borrow_mut() = Some((
                                                    result.exit_code,
                                                    result.success(),
                                                    result.duration_ms,
                                                ));
                                            })
                                            .into_element(),
                                    )
                                    .into_element(),
                            )
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            let (exit_code, success, duration_ms) = failure.borrow().expect("on_error fired");
            assert!(!success);
            assert_ne!(exit_code, 0);
            assert!(duration_ms >= 100 && duration_ms < 5_000);

            // The step completed with the failure mirrored, and no task
            // leaked.
            let steps = store.steps().list().unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].status, "completed");
            assert!(steps[0].error.as_deref().unwrap().contains("failed"));
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);
        });
    }
}

// =============================================================================
// Scenario: phase without a step, containing one agent call
// =============================================================================

mod solo_agent_phase {
    use super::*;

    #[test]
    fn task_count_fallback_advances_the_phase() {
        block_on_local(async {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let agent = Rc::new(ScriptedAgent::new().with_output("reviewed"));
            let options = EngineOptions::default()
                .with_default_agent(Rc::clone(&agent) as Rc<dyn AgentAdapter>);
            let mut engine = Engine::new(Rc::clone(&store), options).unwrap();

            let finished = Rc::new(RefCell::new(None::<String>));
            let finished_cb = Rc::clone(&finished);
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("Solo")
                            .child(
                                Agent::new("review the diff")
                                    .on_finished(move |outcome| {
                                        *finished_cb.borrow_mut() = Some(outcome.output.clone());
                                    })
                                    .into_element(),
                            )
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert_eq!(finished.borrow().as_deref(), Some("reviewed"));
            assert_eq!(agent.call_count(), 1);
            assert_eq!(get_state::<u64>(&store, "currentPhaseIndex"), Some(1));
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
            // The agent task is attributed and terminal.
            let tasks = store.tasks().list(Some(0)).unwrap();
            let agents: Vec<_> = tasks
                .iter()
                .filter(|t| t.component_type == "agent")
                .collect();
            assert_eq!(agents.len(), 1);
            assert_eq!(agents[0].status, "completed");
        });
    }

    #[test]
    fn persisted_outcome_skips_the_adapter_on_remount() {
        block_on_local(async {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let agent = Rc::new(ScriptedAgent::new().with_output("first run"));
            let options = EngineOptions::default()
                .with_default_agent(Rc::clone(&agent) as Rc<dyn AgentAdapter>);
            let mut engine = Engine::new(Rc::clone(&store), options).unwrap();

            engine.render(Agent::new("summarize").into_element());
            engine.run_until_settled().await;
            assert_eq!(agent.call_count(), 1);

            // Same prompt in a fresh engine against the same store: resolved
            // from the persisted outcome.
            drop(engine);
            let agent2 = Rc::new(ScriptedAgent::new().with_output("second run"));
            let options = EngineOptions::default()
                .with_default_agent(Rc::clone(&agent2) as Rc<dyn AgentAdapter>);
            let mut engine = Engine::new(Rc::clone(&store), options).unwrap();
            let finished = Rc::new(RefCell::new(None::<String>));
            let finished_cb = Rc::clone(&finished);
            engine.render(
                Agent::new("summarize")
                    .on_finished(move |o| *finished_cb.borrow_mut() = Some(o.output.clone()))
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert_eq!(agent2.call_count(), 0);
            assert_eq!(finished.borrow().as_deref(), Some("first run"));
        });
    }
}

// =============================================================================
// While boundaries
// =============================================================================

mod while_boundaries {
    use super::*;

    fn run_loop(condition: Condition, max: u64) -> (Rc<Store>, Vec<(u64, CompletionReason)>) {
        block_on_local(async move {
            let (store, mut engine) = memory_engine();
            let completions: Rc<RefCell<Vec<(u64, CompletionReason)>>> =
                Rc::new(RefCell::new(Vec::new()));
            let completions_cb = Rc::clone(&completions);
            engine.render(
                While::new("L")
                    .condition(condition)
                    .max_iterations(max)
                    .on_complete(move |i, r| completions_cb.borrow_mut().push((i, r)))
                    .into_element(),
            );
            engine.run_until_settled().await;
            let result = completions.borrow().clone();
            (store, result)
        })
    }

    #[test]
    fn false_condition_completes_immediately() {
        let (store, completions) = run_loop(Condition::sync(|| false), 10);
        assert_eq!(completions, vec![(0, CompletionReason::Condition)]);
        assert_eq!(
            get_state::<String>(&store, "while.L.status").as_deref(),
            Some("complete")
        );
        // The loop never started an iteration.
        assert_eq!(get_state::<u64>(&store, "while.L.iteration"), None);
    }

    #[test]
    fn zero_budget_with_true_condition_completes_with_condition_reason() {
        let (_, completions) = run_loop(Condition::always(), 0);
        assert_eq!(completions, vec![(0, CompletionReason::Condition)]);
    }

    #[test]
    fn exhausted_budget_reports_max() {
        let (store, completions) = run_loop(Condition::always(), 3);
        assert_eq!(completions, vec![(3, CompletionReason::Max)]);
        assert_eq!(get_state::<u64>(&store, "while.L.iteration"), Some(2));
        assert_eq!(get_state::<u64>(&store, "ralphCount"), Some(2));
    }

    #[test]
    fn async_condition_counts_iterations() {
        let calls = Rc::new(Cell::new(0u32));
        let calls_cb = Rc::clone(&calls);
        let condition = Condition::async_fn(move || {
            let calls = Rc::clone(&calls_cb);
            async move {
                calls.set(calls.get() + 1);
                Ok(calls.get() <= 2)
            }
        });
        let (_, completions) = run_loop(condition, 10);
        // Evaluations: initial true, after iter 0 true, after iter 1 false.
        assert_eq!(completions, vec![(2, CompletionReason::Condition)]);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn failing_condition_pins_the_loop_in_error() {
        let errors = Rc::new(Cell::new(0u32));
        let errors_cb = Rc::clone(&errors);
        block_on_local(async move {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let options = EngineOptions::default()
                .with_on_error(move |_| errors_cb.set(errors_cb.get() + 1));
            let mut engine = Engine::new(Rc::clone(&store), options).unwrap();
            engine.render(
                While::new("L")
                    .condition(Condition::try_sync(|| anyhow::bail!("flaky oracle")))
                    .into_element(),
            );
            engine.run_until_settled().await;
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("error")
            );
        });
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn iteration_timeout_throttles_advances() {
        block_on_local(async {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let options = EngineOptions::default()
                .with_iteration_timeout(Duration::from_millis(40));
            let mut engine = Engine::new(Rc::clone(&store), options).unwrap();

            let start = Instant::now();
            engine.render(Ralph::new("L", 3).into_element());
            engine.run_until_settled().await;

            // Two iteration advances plus the completing signal, each
            // spaced by the minimum delay.
            assert!(
                start.elapsed() >= Duration::from_millis(80),
                "advances were not throttled: {:?}",
                start.elapsed()
            );
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
        });
    }
}

// =============================================================================
// Phase behaviors
// =============================================================================

mod phase_behaviors {
    use super::*;

    #[test]
    fn skip_if_skips_and_advances_once() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("skipped")
                            .skip_if(|| Ok(true))
                            .child(phase_never_runs_marker())
                            .into_element(),
                    )
                    .child(phase_with_command("real"))
                    .into_element(),
            );
            engine.run_until_settled().await;

            let phases = store.phases().list().unwrap();
            assert_eq!(phases.len(), 2);
            assert_eq!(phases[0].name, "skipped");
            assert_eq!(phases[0].status, "skipped");
            assert_eq!(phases[1].name, "real");
            assert_eq!(phases[1].status, "completed");
        });
    }

    #[test]
    fn throwing_skip_if_pins_the_phase_without_rows_or_callbacks() {
        block_on_local(async {
            let errors = Rc::new(Cell::new(0u32));
            let errors_cb = Rc::clone(&errors);
            let started = Rc::new(Cell::new(false));
            let started_cb = Rc::clone(&started);

            let store = Rc::new(Store::open_in_memory().unwrap());
            let options = EngineOptions::default()
                .with_on_error(move |_| errors_cb.set(errors_cb.get() + 1));
            let mut engine = Engine::new(Rc::clone(&store), options).unwrap();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("broken")
                            .skip_if(|| anyhow::bail!("cannot decide"))
                            .on_start(move || started_cb.set(true))
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert_eq!(errors.get(), 1);
            assert!(!started.get());
            assert!(store.phases().list().unwrap().is_empty());
            // The cursor did not move.
            assert_eq!(get_state::<u64>(&store, "currentPhaseIndex"), Some(0));
        });
    }

    #[test]
    fn phase_outside_a_loop_is_an_author_error() {
        block_on_local(async {
            let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
            let errors_cb = Rc::clone(&errors);
            let store = Rc::new(Store::open_in_memory().unwrap());
            let options = EngineOptions::default()
                .with_on_error(move |e| errors_cb.borrow_mut().push(e.to_string()));
            let mut engine = Engine::new(store, options).unwrap();
            engine.render(Phase::new("orphan").into_element());
            engine.run_until_settled().await;

            let errors = errors.borrow();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("inside a loop"), "{}", errors[0]);
        });
    }

    fn phase_never_runs_marker() -> Element {
        Step::named("never")
            .child(Command::shell("touch /nonexistent-dir/never").into_element())
            .into_element()
    }
}

// =============================================================================
// Step behaviors
// =============================================================================

mod step_behaviors {
    use super::*;

    #[test]
    fn step_with_no_children_completes() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("empty")
                            .child(Step::named("noop").into_element())
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            let steps = store.steps().list().unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].status, "completed");
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
        });
    }

    #[test]
    fn sequential_steps_never_overlap() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let order: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

            let tracked_step = |name: &str, order: &Rc<RefCell<Vec<String>>>| {
                let on_start = {
                    let order = Rc::clone(order);
                    let name = name.to_string();
                    move || order.borrow_mut().push(format!("start:{}", name))
                };
                let on_complete = {
                    let order = Rc::clone(order);
                    let name = name.to_string();
                    move || order.borrow_mut().push(format!("done:{}", name))
                };
                Step::named(name)
                    .on_start(on_start)
                    .on_complete(on_complete)
                    .child(Command::argv(vec!["true".into()]).into_element())
                    .into_element()
            };

            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("seq")
                            .child(tracked_step("one", &order))
                            .child(tracked_step("two", &order))
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert_eq!(
                *order.borrow(),
                vec!["start:one", "done:one", "start:two", "done:two"]
            );
            // Cursor history for the phase's registry is monotonic.
            let history = store.state().history("stepIndex_seq", 50).unwrap();
            let values: Vec<u64> = history
                .iter()
                .rev()
                .filter_map(|e| e.new_value.as_ref().and_then(|v| v.as_u64()))
                .collect();
            assert_eq!(values.last(), Some(&2));
        });
    }

    #[test]
    fn free_steps_under_a_loop_complete_each_iteration() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(
                Ralph::new("L", 2)
                    .child(
                        Step::named("direct")
                            .child(Command::argv(vec!["true".into()]).into_element())
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            let steps = store.steps().list().unwrap();
            assert_eq!(steps.len(), 2, "one step row per iteration");
            assert!(steps.iter().all(|s| s.status == "completed"));
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
        });
    }
}

// =============================================================================
// VCS hooks: step snapshots, commits, and the attachment slot
// =============================================================================

mod vcs_hooks {
    use super::*;
    use smithers::adapters::GitVcs;
    use smithers::elements::Snapshot;

    fn git_engine() -> (tempfile::TempDir, Rc<Store>, Engine) {
        let dir = tempfile::TempDir::new().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("src.txt"), "v1").unwrap();
        let vcs = Rc::new(GitVcs::open(dir.path()).unwrap());
        let store = Rc::new(Store::open_in_memory().unwrap());
        let options = EngineOptions::default().with_vcs(vcs);
        let engine = Engine::new(Rc::clone(&store), options).unwrap();
        (dir, store, engine)
    }

    #[test]
    fn step_snapshot_and_commit_attach_to_the_row() {
        block_on_local(async {
            let (_dir, store, mut engine) = git_engine();
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("ship")
                            .child(
                                Step::named("land")
                                    .snapshot_before()
                                    .commit_after("feat: land the change")
                                    .child(Command::argv(vec!["true".into()]).into_element())
                                    .into_element(),
                            )
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            let steps = store.steps().list().unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].status, "completed");
            assert!(steps[0].snapshot_before.is_some());
            assert!(steps[0].commit_created.is_some());

            // Both VCS operations were logged as events.
            let events = store.vcs().list().unwrap();
            assert_eq!(events.len(), 2);
            assert!(events.iter().any(|e| e.message.contains("feat: land")));
        });
    }

    #[test]
    fn snapshot_leaf_runs_inside_a_step_scope() {
        block_on_local(async {
            let (_dir, store, mut engine) = git_engine();
            let change: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
            let change_cb = Rc::clone(&change);
            engine.render(
                Ralph::new("L", 1)
                    .child(
                        Phase::new("record")
                            .child(
                                Step::named("snap")
                                    .child(
                                        Snapshot::new("midpoint")
                                            .on_finished(move |c| {
                                                *change_cb.borrow_mut() =
                                                    Some(c.change_id.clone());
                                            })
                                            .into_element(),
                                    )
                                    .into_element(),
                            )
                            .into_element(),
                    )
                    .into_element(),
            );
            engine.run_until_settled().await;

            assert!(change.borrow().is_some());
            let events = store.vcs().list().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].message, "midpoint");
            // The leaf's change id was attached to the enclosing step row.
            let steps = store.steps().list().unwrap();
            assert_eq!(steps[0].snapshot_after, *change.borrow());
            // The snapshot task was scope-bound and completed.
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);
            assert_eq!(
                get_state::<String>(&store, "while.L.status").as_deref(),
                Some("complete")
            );
        });
    }

    #[test]
    fn snapshot_without_a_vcs_adapter_is_an_author_error() {
        block_on_local(async {
            let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
            let errors_cb = Rc::clone(&errors);
            let store = Rc::new(Store::open_in_memory().unwrap());
            let options = EngineOptions::default()
                .with_on_error(move |e| errors_cb.borrow_mut().push(e.to_string()));
            let mut engine = Engine::new(store, options).unwrap();
            engine.render(Snapshot::new("nowhere").into_element());
            engine.run_until_settled().await;

            let errors = errors.borrow();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("no VCS adapter"), "{}", errors[0]);
        });
    }
}

// =============================================================================
// Control elements and End
// =============================================================================

mod control_flow {
    use super::*;

    #[test]
    fn if_and_switch_select_branches() {
        block_on_local(async {
            let (_, mut engine) = memory_engine();
            engine.render(Element::fragment(vec![
                If::new(true)
                    .then(Element::text("yes"))
                    .otherwise(Element::text("no"))
                    .into_element(),
                Switch::new("b")
                    .case("a", Element::text("first"))
                    .case("b", Element::text("second"))
                    .default(Element::text("fallback"))
                    .into_element(),
            ]));
            engine.run_until_settled().await;

            let serialized = engine.to_serialized_form();
            assert!(serialized.contains("yes"));
            assert!(!serialized.contains("no"));
            assert!(serialized.contains("second"));
            assert!(!serialized.contains("fallback"));
        });
    }

    #[test]
    fn each_renders_every_item_in_order() {
        block_on_local(async {
            let (_, mut engine) = memory_engine();
            let items = vec![
                serde_json::json!("alpha"),
                serde_json::json!("beta"),
                serde_json::json!("gamma"),
            ];
            engine.render(
                smithers::elements::Each::new(items, |item, index| {
                    Element::text(format!("{}:{}", index, item.as_str().unwrap_or("")))
                })
                .into_element(),
            );
            engine.run_until_settled().await;

            let serialized = engine.to_serialized_form();
            let alpha = serialized.find("0:alpha").unwrap();
            let beta = serialized.find("1:beta").unwrap();
            let gamma = serialized.find("2:gamma").unwrap();
            assert!(alpha < beta && beta < gamma);
        });
    }

    #[test]
    fn end_finalizes_the_execution_and_reports_exit() {
        block_on_local(async {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let engine_store = Rc::clone(&store);
            let mut engine = Engine::new(engine_store, EngineOptions::default()).unwrap();
            engine.render(
                End::new()
                    .exit_code(0)
                    .summary(serde_json::json!({"phases": 2}))
                    .reason("all work landed")
                    .into_element(),
            );
            let status = engine.run().await;

            assert_eq!(status.exit_code, 0);
            assert_eq!(status.reason, "all work landed");

            let execution = store.executions().latest().unwrap().unwrap();
            assert_eq!(execution.status, "completed");
            assert_eq!(execution.exit_code, Some(0));
            assert_eq!(
                execution.end_summary,
                Some(serde_json::json!({"phases": 2}))
            );
            assert!(get_state::<serde_json::Value>(&store, "stop_requested").is_some());
        });
    }

    #[test]
    fn end_inside_a_loop_stops_the_run() {
        block_on_local(async {
            let store = Rc::new(Store::open_in_memory().unwrap());
            let mut engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
            engine.render(
                Ralph::new("L", 10)
                    .child(
                        Phase::new("finish")
                            .child(End::new().reason("done early").into_element())
                            .into_element(),
                    )
                    .into_element(),
            );
            let status = engine.run().await;

            assert_eq!(status.exit_code, 0);
            // The stop request kept the loop from burning its budget.
            let iteration: u64 = get_state(&store, "while.L.iteration").unwrap();
            assert!(iteration < 9, "loop ran too long: {}", iteration);
        });
    }
}

// =============================================================================
// Resumability and serialization
// =============================================================================

mod durability {
    use super::*;

    const RESERVED: [&str; 4] = [
        "ralphCount",
        "currentPhaseIndex",
        "while.L.iteration",
        "while.L.status",
    ];

    #[test]
    fn remounting_a_finished_tree_reproduces_reserved_keys_and_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("wf.db");
        let tree = || {
            Ralph::new("L", 1)
                .child(phase_with_command("A"))
                .child(phase_with_command("B"))
                .into_element()
        };

        let snapshot = block_on_local(async {
            let store = Rc::new(Store::open(&db_path).unwrap());
            let mut engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
            engine.render(tree());
            engine.run_until_settled().await;
            reserved_snapshot(&store)
        });

        let (snapshot2, rows) = block_on_local(async {
            let store = Rc::new(Store::open(&db_path).unwrap());
            let mut engine = Engine::new(Rc::clone(&store), EngineOptions::default()).unwrap();
            engine.render(tree());
            engine.run_until_settled().await;
            let rows = (
                store.tasks().list(None).unwrap().len(),
                store.phases().list().unwrap().len(),
                store.steps().list().unwrap().len(),
            );
            (reserved_snapshot(&store), rows)
        });

        assert_eq!(snapshot, snapshot2);
        // The finished loop re-ran nothing: two command tasks and two step
        // tasks from the first run, no additions.
        assert_eq!(rows, (4, 2, 2));
    }

    #[test]
    fn re_render_without_events_is_row_stable_and_byte_stable() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            let tree = Ralph::new("L", 1)
                .child(phase_with_command("A"))
                .into_element();
            engine.render(tree.clone());
            engine.run_until_settled().await;

            let rows_before = (
                store.tasks().list(None).unwrap().len(),
                store.phases().list().unwrap().len(),
                store.steps().list().unwrap().len(),
            );
            let serialized_before = engine.to_serialized_form();
            // Two consecutive serializations with no state change are
            // byte-equal.
            assert_eq!(serialized_before, engine.to_serialized_form());

            engine.render(tree);
            engine.run_until_settled().await;

            let rows_after = (
                store.tasks().list(None).unwrap().len(),
                store.phases().list().unwrap().len(),
                store.steps().list().unwrap().len(),
            );
            assert_eq!(rows_before, rows_after);
            assert_eq!(serialized_before, engine.to_serialized_form());
        });
    }

    #[test]
    fn serialized_form_shows_placeholders_with_canonical_attrs() {
        block_on_local(async {
            let (_, mut engine) = memory_engine();
            engine.render(
                While::new("L")
                    .condition(Condition::sync(|| false))
                    .into_element(),
            );
            engine.run_until_settled().await;

            let serialized = engine.to_serialized_form();
            assert_eq!(
                serialized,
                "<root><while id=\"L\" iteration=\"0\" maxIterations=\"10\" status=\"complete\"/></root>"
            );
        });
    }

    #[test]
    fn dispose_is_idempotent_and_releases_tasks() {
        block_on_local(async {
            let (store, mut engine) = memory_engine();
            engine.render(Human::new().message("waiting").into_element());
            engine.run_until_settled().await;
            assert_eq!(store.tasks().running_count(0).unwrap(), 1);

            engine.dispose();
            engine.dispose();
            assert_eq!(store.tasks().running_count(0).unwrap(), 0);
        });
    }

    fn reserved_snapshot(store: &Store) -> Vec<(String, Option<serde_json::Value>)> {
        RESERVED
            .iter()
            .map(|key| (key.to_string(), store.state().get_raw(key).unwrap()))
            .collect()
    }
}

// =============================================================================
// CLI
// =============================================================================

mod cli {
    use super::*;
    use assert_cmd::Command as CliCommand;
    use assert_cmd::cargo::cargo_bin_cmd;
    use predicates::prelude::*;

    fn smithers() -> CliCommand {
        cargo_bin_cmd!("smithers")
    }

    fn seeded_db(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let db_path = dir.path().join("wf.db");
        let store = Store::open(&db_path).unwrap();
        store.executions().begin("nightly", "workflow.rs").unwrap();
        store.state().set("ralphCount", &3u64, "loop L iteration 3").unwrap();
        store.tasks().start("agent", "reviewer", 3, None).unwrap();
        store.phases().start("build", 3).unwrap();
        store.human().create("confirmation", "Deploy to prod?").unwrap();
        store
            .vcs()
            .record("git", Some("abc1234def"), Some("abc1234def"), "feat: seed")
            .unwrap();
        store
            .tickets()
            .create(smithers::store::TicketDraft {
                title: "Harden the API".into(),
                priority: 5,
                ..Default::default()
            })
            .unwrap();
        db_path
    }

    #[test]
    fn init_creates_structure_and_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        smithers()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized"));
        assert!(dir.path().join(".smithers").exists());
        assert!(dir.path().join("smithers.toml").exists());

        smithers()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn status_without_database_fails_with_a_hint() {
        let dir = tempfile::TempDir::new().unwrap();
        smithers()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No workflow database"));
    }

    #[test]
    fn status_reports_execution_and_pending_gates() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = seeded_db(&dir);
        smithers()
            .arg("--db")
            .arg(&db_path)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("nightly"))
            .stdout(predicate::str::contains("running"))
            .stdout(predicate::str::contains("pending"));
    }

    #[test]
    fn state_get_and_history_print_values() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = seeded_db(&dir);
        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["state", "get", "ralphCount"])
            .assert()
            .success()
            .stdout(predicate::str::contains("3"));
        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["state", "history", "ralphCount"])
            .assert()
            .success()
            .stdout(predicate::str::contains("loop L iteration 3"));
        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["state", "get", "missing"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(unset)"));
    }

    #[test]
    fn tasks_and_phases_list_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = seeded_db(&dir);
        smithers()
            .arg("--db")
            .arg(&db_path)
            .arg("tasks")
            .assert()
            .success()
            .stdout(predicate::str::contains("reviewer"));
        smithers()
            .arg("--db")
            .arg(&db_path)
            .arg("phases")
            .assert()
            .success()
            .stdout(predicate::str::contains("build"));
    }

    #[test]
    fn vcs_and_tickets_list_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = seeded_db(&dir);
        smithers()
            .arg("--db")
            .arg(&db_path)
            .arg("vcs")
            .assert()
            .success()
            .stdout(predicate::str::contains("feat: seed"));
        smithers()
            .arg("--db")
            .arg(&db_path)
            .arg("tickets")
            .assert()
            .success()
            .stdout(predicate::str::contains("Harden the API"));
        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["tickets", "--status", "done"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No tickets"));
        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["tickets", "--status", "bogus"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown ticket status"));
    }

    #[test]
    fn resolve_approves_a_gate_by_id_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = seeded_db(&dir);
        let store = Store::open(&db_path).unwrap();
        let gate_id = store.human().pending().unwrap()[0].id.clone();

        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["resolve", &gate_id[..8], "--approve"])
            .assert()
            .success()
            .stdout(predicate::str::contains("approved"));

        let row = store.human().get(&gate_id).unwrap().unwrap();
        assert_eq!(row.status, "approved");
    }

    #[test]
    fn resolve_rejects_unknown_ids() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = seeded_db(&dir);
        smithers()
            .arg("--db")
            .arg(&db_path)
            .args(["resolve", "zzzzzz", "--approve"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No pending interaction"));
    }
}
