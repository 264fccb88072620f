//! Engine-level properties: reference-count bookkeeping, old-state
//! restoration, where-clauses, map equality resolution, generators, tracing
//! and limits.

use ahash::AHashMap;
use pretty_assertions::assert_eq;
use skolem::{
    Body, Contract, Context, Decl, ExprLoc, FailureSource, Guard, Id, IdTypeWhere, LabeledStmt, Limits, MapRepr,
    Memory, NoopBackend, Outcome, Program, RandomGenerator, RecordingTracer, SolverBridge, StmtLoc, Summary,
    TestCase, TraceEvent, Type, Value, execute_program, execute_program_det, execute_program_generic,
};

fn s(name: &str) -> Id {
    name.to_owned()
}

fn plain(stmts: Vec<StmtLoc>) -> Vec<LabeledStmt> {
    stmts.into_iter().map(LabeledStmt::plain).collect()
}

fn procedure(
    name: &str,
    ins: Vec<IdTypeWhere>,
    outs: Vec<IdTypeWhere>,
    contracts: Vec<Contract>,
    locals: Vec<IdTypeWhere>,
    stmts: Vec<StmtLoc>,
) -> Decl {
    Decl::ProcedureDecl {
        name: s(name),
        type_args: vec![],
        in_params: ins,
        out_params: outs,
        contracts,
        body: Some(Body {
            locals,
            block: plain(stmts),
        }),
    }
}

fn program_of(decls: Vec<Decl>) -> (Program, Context) {
    let program = Program::new(decls);
    let context = Context::from_program(&program);
    (program, context)
}

fn run_det(decls: Vec<Decl>, entry: &str) -> TestCase {
    let (program, context) = program_of(decls);
    execute_program_det(&program, &context, Some(128), entry)
}

fn int_map() -> Type {
    Type::map(vec![Type::Int], Type::Int)
}

/// Recomputes every live entry's expected count from the stores and the heap
/// itself, and compares with the maintained counts.
fn check_heap_invariant(mem: &Memory) {
    let mut expected: AHashMap<usize, usize> = AHashMap::new();
    let mut bump = |expected: &mut AHashMap<usize, usize>, value: &Value| {
        if let Value::Ref(id) = value {
            *expected.entry(id.index()).or_default() += 1;
        }
    };
    for store in [&mem.locals, &mem.globals, &mem.old_globals, &mem.constants] {
        for value in store.values() {
            bump(&mut expected, value);
        }
    }
    for id in mem.heap.live_ids() {
        match mem.heap.payload(id) {
            MapRepr::Source(store) => {
                for value in store.values() {
                    bump(&mut expected, value);
                }
            }
            MapRepr::Derived { base, overrides } => {
                *expected.entry(base.index()).or_default() += 1;
                for value in overrides.values() {
                    bump(&mut expected, value);
                }
            }
        }
    }
    for id in mem.heap.live_ids() {
        assert_eq!(
            mem.heap.refcount(id),
            expected.get(&id.index()).copied().unwrap_or(0),
            "count invariant violated for map@{id}",
        );
    }
}

// =============================================================================
// Heap bookkeeping
// =============================================================================

fn map_heavy_program() -> Vec<Decl> {
    let store = |index: i64, value: i64| {
        StmtLoc::assign_indexed("array", vec![vec![ExprLoc::int_lit(index)]], ExprLoc::int_lit(value))
    };
    vec![
        Decl::VarDecl(vec![IdTypeWhere::new("array", int_map())]),
        procedure(
            "Copy",
            vec![IdTypeWhere::new("a", int_map())],
            vec![IdTypeWhere::new("b", int_map())],
            vec![],
            vec![],
            vec![StmtLoc::assign(
                "b",
                ExprLoc::var("a").update(vec![ExprLoc::int_lit(9)], ExprLoc::int_lit(9)),
            )],
        ),
        procedure(
            "Main",
            vec![],
            vec![],
            vec![Contract::Modifies(vec![s("array")])],
            vec![IdTypeWhere::new("copy", int_map())],
            vec![
                store(0, 1),
                store(1, 2),
                StmtLoc::call(vec![s("copy")], "Copy", vec![ExprLoc::var("array")]),
                StmtLoc::assertion(
                    ExprLoc::var("copy")
                        .select(vec![ExprLoc::int_lit(9)])
                        .eq(ExprLoc::int_lit(9)),
                ),
                StmtLoc::assertion(
                    ExprLoc::var("copy")
                        .select(vec![ExprLoc::int_lit(0)])
                        .eq(ExprLoc::var("array").select(vec![ExprLoc::int_lit(0)])),
                ),
            ],
        ),
    ]
}

#[test]
fn reference_counts_satisfy_the_invariant_after_a_run() {
    let case = run_det(map_heavy_program(), "Main");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
    check_heap_invariant(&case.memory);
}

#[test]
fn garbage_collection_leaves_no_unreferenced_entries() {
    let case = run_det(map_heavy_program(), "Main");
    let mut heap = case.memory.heap.clone();
    // everything still live is reachable from a store; a sweep on the final
    // state must find nothing to free
    assert!(heap.collect_garbage().is_empty());
}

// =============================================================================
// Old state and modifies across calls
// =============================================================================

fn counter_program() -> Vec<Decl> {
    let inc_post = ExprLoc::var("g").eq(ExprLoc::var("g").old().plus(ExprLoc::int_lit(1)));
    vec![
        Decl::VarDecl(vec![IdTypeWhere::new("g", Type::Int)]),
        procedure(
            "Inc",
            vec![],
            vec![],
            vec![
                Contract::Modifies(vec![s("g")]),
                Contract::Ensures {
                    free: false,
                    expr: inc_post,
                },
            ],
            vec![],
            vec![StmtLoc::assign("g", ExprLoc::var("g").plus(ExprLoc::int_lit(1)))],
        ),
        procedure(
            "Main",
            vec![],
            vec![],
            vec![Contract::Modifies(vec![s("g")])],
            vec![],
            vec![
                StmtLoc::call(vec![], "Inc", vec![]),
                StmtLoc::call(vec![], "Inc", vec![]),
                StmtLoc::assertion(ExprLoc::var("g").eq(ExprLoc::var("g").old().plus(ExprLoc::int_lit(2)))),
            ],
        ),
    ]
}

/// The callee's lazily materialized old value of `g` is clean for the caller
/// (the caller never wrote `g` before the first call), so `old(g)` in `Main`
/// still means the state before both increments.
#[test]
fn clean_old_values_survive_the_call_boundary() {
    let case = run_det(counter_program(), "Main");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
    assert_eq!(case.memory.globals.get("g"), Some(&Value::int(2)));
    assert_eq!(case.memory.old_globals.get("g"), Some(&Value::int(0)));
}

// =============================================================================
// Where clauses
// =============================================================================

fn where_program(clause: ExprLoc) -> Vec<Decl> {
    vec![
        Decl::VarDecl(vec![IdTypeWhere::new("g", Type::Int).with_where(clause)]),
        procedure(
            "P",
            vec![],
            vec![IdTypeWhere::new("r", Type::Int)],
            vec![],
            vec![],
            vec![StmtLoc::assign("r", ExprLoc::var("g"))],
        ),
    ]
}

#[test]
fn satisfied_where_clause_passes() {
    let case = run_det(where_program(ExprLoc::var("g").geq(ExprLoc::int_lit(0))), "P");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
    assert_eq!(case.local("r"), Some(&Value::int(0)));
}

#[test]
fn violated_where_clause_is_invalid_not_failed() {
    let case = run_det(where_program(ExprLoc::var("g").gt(ExprLoc::int_lit(0))), "P");
    assert_eq!(case.outcome(), Outcome::Invalid, "report: {case}");
}

// =============================================================================
// Map equality
// =============================================================================

fn two_maps_program(assertion: ExprLoc) -> Vec<Decl> {
    vec![procedure(
        "P",
        vec![],
        vec![],
        vec![],
        vec![
            IdTypeWhere::new("m", int_map()),
            IdTypeWhere::new("n", int_map()),
        ],
        vec![StmtLoc::assertion(assertion)],
    )]
}

#[test]
fn aliased_maps_are_equal() {
    let case = run_det(
        vec![procedure(
            "P",
            vec![],
            vec![],
            vec![],
            vec![
                IdTypeWhere::new("m", int_map()),
                IdTypeWhere::new("n", int_map()),
            ],
            vec![
                StmtLoc::assign("m", ExprLoc::var("n")),
                StmtLoc::assertion(ExprLoc::var("m").eq(ExprLoc::var("n"))),
            ],
        )],
        "P",
    );
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
}

#[test]
fn deterministic_fresh_maps_are_distinguished() {
    // the deterministic generator answers "not equal", and the difference is
    // installed in the sources
    let case = run_det(two_maps_program(ExprLoc::var("m").neq(ExprLoc::var("n"))), "P");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
}

#[test]
fn exhaustive_map_equality_explores_both_answers() {
    let (program, context) = program_of(two_maps_program(ExprLoc::var("m").eq(ExprLoc::var("n"))));
    let outcomes: Vec<Outcome> = execute_program(&program, &context, Some(16), "P")
        .map(|case| case.outcome())
        .collect();
    assert!(outcomes.contains(&Outcome::Passed), "forcing equality must succeed");
    assert!(outcomes.contains(&Outcome::Failed), "distinguishing must fail the assertion");
}

// =============================================================================
// Generators
// =============================================================================

#[test]
fn exhaustive_generator_enumerates_lazy_inputs_in_zigzag_order() {
    let (program, context) = program_of(vec![procedure(
        "P",
        vec![],
        vec![IdTypeWhere::new("y", Type::Int)],
        vec![],
        vec![],
        vec![StmtLoc::assumption(ExprLoc::var("y").gt(ExprLoc::int_lit(0)))],
    )]);
    let cases: Vec<TestCase> = execute_program(&program, &context, Some(16), "P").collect();
    let outcomes: Vec<Outcome> = cases.iter().map(TestCase::outcome).collect();
    // y is drawn as 0, 1, -1, 2, -2, 3, -3
    assert_eq!(
        outcomes,
        vec![
            Outcome::Invalid,
            Outcome::Passed,
            Outcome::Invalid,
            Outcome::Passed,
            Outcome::Invalid,
            Outcome::Passed,
            Outcome::Invalid,
        ]
    );
    let mut summary = Summary::new();
    for case in &cases {
        summary.add(case);
    }
    assert_eq!(summary.total(), 7);
    assert_eq!(summary.passed, 3);
    assert_eq!(summary.invalid, 4);
    assert_eq!(summary.unique_failures(), 0, "assumption violations are not failures");
}

#[test]
fn random_generator_is_reproducible_and_retries_dead_branches() {
    let branchy = vec![procedure(
        "P",
        vec![],
        vec![IdTypeWhere::new("y", Type::Int)],
        vec![],
        vec![],
        vec![StmtLoc::if_stmt(
            Guard::Wildcard,
            plain(vec![
                StmtLoc::assumption(ExprLoc::bool_lit(false)),
                StmtLoc::assign("y", ExprLoc::int_lit(1)),
            ]),
            Some(plain(vec![StmtLoc::assign("y", ExprLoc::int_lit(2))])),
        )],
    )];
    let (program, context) = program_of(branchy);
    let run = |seed: u64| -> Vec<String> {
        execute_program_generic(&program, &context, RandomGenerator::new(seed, 3, 5), Some(16), "P")
            .map(|case| case.report(false))
            .collect()
    };
    let first = run(11);
    assert_eq!(first.len(), 5);
    for report in &first {
        // a single-path generator backtracks past the dead arm
        assert!(report.ends_with("passed"), "unexpected report: {report}");
    }
    assert_eq!(first, run(11));
}

// =============================================================================
// Tracing, limits, solver bridge
// =============================================================================

#[test]
fn recording_tracer_sees_calls_and_clauses() {
    let (program, context) = program_of(counter_program());
    let mut cases = execute_program_generic(
        &program,
        &context,
        skolem::DeterministicGenerator,
        Some(16),
        "Main",
    );
    let mut tracer = RecordingTracer::new();
    let case = cases
        .next_case::<RecordingTracer, NoopBackend>(&mut tracer, None)
        .expect("one deterministic case");
    assert_eq!(case.outcome(), Outcome::Passed);
    assert!(
        tracer
            .events
            .iter()
            .any(|event| matches!(event, TraceEvent::Call { callee, .. } if callee == "Inc")),
        "missing call event: {events:?}",
        events = tracer.events
    );
    assert!(
        tracer
            .events
            .iter()
            .any(|event| matches!(event, TraceEvent::Clause { holds: true, .. })),
        "missing clause event"
    );
}

#[test]
fn step_limit_makes_the_run_non_executable() {
    let (program, context) = program_of(counter_program());
    let case = execute_program_generic(&program, &context, skolem::DeterministicGenerator, Some(16), "Main")
        .with_limits(Limits::new(Some(2), None))
        .next()
        .expect("one deterministic case");
    assert_eq!(case.outcome(), Outcome::Nonexecutable);
    assert!(matches!(
        case.failure.as_ref().expect("a failure is present").source,
        FailureSource::LimitExceeded(_)
    ));
}

#[test]
fn solver_bridge_stays_in_sync_across_runs() {
    let (program, context) = program_of(counter_program());
    let mut bridge = SolverBridge::new(NoopBackend);
    let mut cases = execute_program_generic(
        &program,
        &context,
        skolem::DeterministicGenerator,
        Some(16),
        "Main",
    );
    let case = cases
        .next_case(&mut skolem::NoopTracer, Some(&mut bridge))
        .expect("one deterministic case");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
}

// =============================================================================
// Stack traces
// =============================================================================

#[test]
fn failures_accumulate_call_frames() {
    let decls = vec![
        procedure(
            "Inner",
            vec![],
            vec![],
            vec![],
            vec![],
            vec![StmtLoc::assertion(ExprLoc::bool_lit(false))],
        ),
        procedure(
            "Outer",
            vec![],
            vec![],
            vec![],
            vec![],
            vec![StmtLoc::call(vec![], "Inner", vec![])],
        ),
        procedure(
            "Main",
            vec![],
            vec![],
            vec![],
            vec![],
            vec![StmtLoc::call(vec![], "Outer", vec![])],
        ),
    ];
    let case = run_det(decls, "Main");
    assert_eq!(case.outcome(), Outcome::Failed);
    let trace = &case.failure.as_ref().expect("a failure is present").trace;
    let callees: Vec<&str> = trace.iter().map(|frame| frame.callee.as_str()).collect();
    assert_eq!(callees, vec!["Inner", "Outer"]);
}
