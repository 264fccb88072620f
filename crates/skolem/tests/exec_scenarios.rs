//! End-to-end scenarios: whole programs built as ASTs, executed through the
//! public entry points, checked against their expected outcomes.

use pretty_assertions::assert_eq;
use skolem::{
    Body, Contract, Context, Decl, ExprLoc, FailureSource, Guard, Id, IdType, IdTypeWhere, LabeledStmt, Outcome, Pos,
    Program, SpecClause, SpecKind, StmtLoc, TestCase, Type, Value, execute_program, execute_program_det,
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

fn run_det(decls: Vec<Decl>, entry: &str) -> TestCase {
    run_det_bounded(decls, entry, Some(128))
}

fn run_det_bounded(decls: Vec<Decl>, entry: &str, qbound: Option<usize>) -> TestCase {
    let program = Program::new(decls);
    let context = Context::from_program(&program);
    execute_program_det(&program, &context, qbound, entry)
}

fn run_all(decls: Vec<Decl>, entry: &str) -> Vec<TestCase> {
    let program = Program::new(decls);
    let context = Context::from_program(&program);
    execute_program(&program, &context, Some(128), entry).collect()
}

fn int_map() -> Type {
    Type::map(vec![Type::Int], Type::Int)
}

// =============================================================================
// LinearSearch / BinarySearch equivalence
// =============================================================================

/// `LinearSearch(a, n, x)`: scan `a[0..n)` for `x`, return the index or -1.
fn linear_search() -> Decl {
    let guard = ExprLoc::var("i").lt(ExprLoc::var("n"));
    let hit = ExprLoc::var("a").select(vec![ExprLoc::var("i")]).eq(ExprLoc::var("x"));
    let loop_body = plain(vec![
        StmtLoc::if_stmt(
            Guard::Expr(hit),
            plain(vec![
                StmtLoc::assign("idx", ExprLoc::var("i")),
                StmtLoc::break_stmt(None),
            ]),
            None,
        ),
        StmtLoc::assign("i", ExprLoc::var("i").plus(ExprLoc::int_lit(1))),
    ]);
    procedure(
        "LinearSearch",
        vec![
            IdTypeWhere::new("a", int_map()),
            IdTypeWhere::new("n", Type::Int),
            IdTypeWhere::new("x", Type::Int),
        ],
        vec![IdTypeWhere::new("idx", Type::Int)],
        vec![],
        vec![IdTypeWhere::new("i", Type::Int)],
        vec![
            StmtLoc::assign("idx", ExprLoc::int_lit(-1)),
            StmtLoc::assign("i", ExprLoc::int_lit(0)),
            StmtLoc::new(
                Pos::NONE,
                skolem::Stmt::While {
                    guard: Guard::Expr(guard),
                    invariants: vec![],
                    body: loop_body,
                },
            ),
        ],
    )
}

/// `BinarySearch(a, n, x)`: halving search over the sorted prefix `a[0..n)`.
fn binary_search() -> Decl {
    let guard = ExprLoc::var("lo").lt(ExprLoc::var("hi"));
    let invariant = SpecClause::new(
        SpecKind::LoopInvariant,
        false,
        ExprLoc::int_lit(0)
            .leq(ExprLoc::var("lo"))
            .and(ExprLoc::var("hi").leq(ExprLoc::var("n"))),
    );
    let probe = ExprLoc::var("a").select(vec![ExprLoc::var("mid")]);
    let loop_body = plain(vec![
        StmtLoc::assign(
            "mid",
            ExprLoc::var("lo").plus(ExprLoc::var("hi")).div(ExprLoc::int_lit(2)),
        ),
        StmtLoc::if_stmt(
            Guard::Expr(probe.clone().eq(ExprLoc::var("x"))),
            plain(vec![
                StmtLoc::assign("idx", ExprLoc::var("mid")),
                StmtLoc::break_stmt(None),
            ]),
            Some(plain(vec![StmtLoc::if_stmt(
                Guard::Expr(probe.lt(ExprLoc::var("x"))),
                plain(vec![StmtLoc::assign(
                    "lo",
                    ExprLoc::var("mid").plus(ExprLoc::int_lit(1)),
                )]),
                Some(plain(vec![StmtLoc::assign("hi", ExprLoc::var("mid"))])),
            )])),
        ),
    ]);
    procedure(
        "BinarySearch",
        vec![
            IdTypeWhere::new("a", int_map()),
            IdTypeWhere::new("n", Type::Int),
            IdTypeWhere::new("x", Type::Int),
        ],
        vec![IdTypeWhere::new("idx", Type::Int)],
        vec![],
        vec![
            IdTypeWhere::new("lo", Type::Int),
            IdTypeWhere::new("hi", Type::Int),
            IdTypeWhere::new("mid", Type::Int),
        ],
        vec![
            StmtLoc::assign("idx", ExprLoc::int_lit(-1)),
            StmtLoc::assign("lo", ExprLoc::int_lit(0)),
            StmtLoc::assign("hi", ExprLoc::var("n")),
            StmtLoc::new(
                Pos::NONE,
                skolem::Stmt::While {
                    guard: Guard::Expr(guard),
                    invariants: vec![invariant],
                    body: loop_body,
                },
            ),
        ],
    )
}

fn search_program() -> Vec<Decl> {
    let store = |index: i64, value: i64| {
        StmtLoc::assign_indexed("array", vec![vec![ExprLoc::int_lit(index)]], ExprLoc::int_lit(value))
    };
    vec![
        Decl::VarDecl(vec![IdTypeWhere::new("array", int_map())]),
        linear_search(),
        binary_search(),
        procedure(
            "Main",
            vec![],
            vec![],
            vec![Contract::Modifies(vec![s("array")])],
            vec![
                IdTypeWhere::new("r1", Type::Int),
                IdTypeWhere::new("r2", Type::Int),
            ],
            vec![
                store(0, -5),
                store(1, 14),
                store(2, 14),
                store(3, 135),
                store(4, 1000),
                StmtLoc::call(
                    vec![s("r1")],
                    "LinearSearch",
                    vec![ExprLoc::var("array"), ExprLoc::int_lit(5), ExprLoc::int_lit(135)],
                ),
                StmtLoc::call(
                    vec![s("r2")],
                    "BinarySearch",
                    vec![ExprLoc::var("array"), ExprLoc::int_lit(5), ExprLoc::int_lit(135)],
                ),
                StmtLoc::assertion(ExprLoc::var("r1").eq(ExprLoc::var("r2"))),
            ],
        ),
    ]
}

#[test]
fn linear_and_binary_search_agree() {
    let case = run_det(search_program(), "Main");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
    assert_eq!(case.local("r1"), Some(&Value::int(3)));
    assert_eq!(case.local("r2"), Some(&Value::int(3)));
}

#[test]
fn deterministic_execution_is_idempotent() {
    let first = run_det(search_program(), "Main");
    let second = run_det(search_program(), "Main");
    assert_eq!(first.report(false), second.report(false));
    assert_eq!(first.outcome(), second.outcome());
}

// =============================================================================
// Division by zero
// =============================================================================

#[test]
fn division_by_zero_fails_at_the_div_position() {
    let div_pos = Pos::new(2, 8);
    let case = run_det(
        vec![procedure(
            "P",
            vec![],
            vec![],
            vec![],
            vec![IdTypeWhere::new("x", Type::Int)],
            vec![StmtLoc::assign(
                "x",
                ExprLoc::int_lit(10).div(ExprLoc::int_lit(0)).at(div_pos),
            )],
        )],
        "P",
    );
    assert_eq!(case.outcome(), Outcome::Failed);
    let failure = case.failure.as_ref().expect("a failure is present");
    assert_eq!(failure.source, FailureSource::DivisionByZero);
    assert_eq!(failure.position, div_pos);
}

// =============================================================================
// Assertion violation
// =============================================================================

#[test]
fn violated_assertion_reports_the_clause() {
    let case = run_det(
        vec![procedure(
            "P",
            vec![],
            vec![],
            vec![],
            vec![],
            vec![StmtLoc::assertion(
                ExprLoc::int_lit(1).eq(ExprLoc::int_lit(2)).at(Pos::new(1, 18)),
            )],
        )],
        "P",
    );
    assert_eq!(case.outcome(), Outcome::Failed);
    let report = case.report(false);
    assert!(
        report.contains("Assertion \"1 == 2\" violated"),
        "unexpected report: {report}"
    );
}

// =============================================================================
// Assumption violation suppresses a branch
// =============================================================================

fn wildcard_branch_program() -> Vec<Decl> {
    vec![procedure(
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
    )]
}

#[test]
fn deterministic_run_retries_past_the_dead_branch() {
    let case = run_det(wildcard_branch_program(), "P");
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
    assert_eq!(case.local("y"), Some(&Value::int(2)));
}

#[test]
fn exhaustive_run_reports_the_dead_branch_as_invalid() {
    let cases = run_all(wildcard_branch_program(), "P");
    let outcomes: Vec<Outcome> = cases.iter().map(TestCase::outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Invalid, Outcome::Passed]);
    assert_eq!(cases[1].local("y"), Some(&Value::int(2)));
}

// =============================================================================
// Axiom-driven constant
// =============================================================================

#[test]
fn axiom_defines_the_constant() {
    let case = run_det(
        vec![
            Decl::ConstantDecl {
                unique: false,
                names: vec![s("K")],
                typ: Type::Int,
                order_spec: None,
                complete: false,
            },
            Decl::AxiomDecl(ExprLoc::var("K").eq(ExprLoc::int_lit(42))),
            procedure(
                "P",
                vec![],
                vec![IdTypeWhere::new("r", Type::Int)],
                vec![],
                vec![],
                vec![StmtLoc::assign("r", ExprLoc::var("K"))],
            ),
        ],
        "P",
    );
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
    assert_eq!(case.local("r"), Some(&Value::int(42)));
}

// =============================================================================
// Quantified domains
// =============================================================================

fn quantified_program() -> Vec<Decl> {
    let body = ExprLoc::int_lit(0)
        .leq(ExprLoc::var("i"))
        .and(ExprLoc::var("i").lt(ExprLoc::int_lit(3)))
        .implies(ExprLoc::var("i").plus(ExprLoc::int_lit(1)).gt(ExprLoc::int_lit(0)));
    vec![procedure(
        "P",
        vec![],
        vec![],
        vec![],
        vec![],
        vec![StmtLoc::assertion(ExprLoc::forall(
            vec![IdType::new("i", Type::Int)],
            body,
        ))],
    )]
}

#[test]
fn bounded_quantifier_enumerates_and_passes() {
    let case = run_det_bounded(quantified_program(), "P", Some(16));
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
}

#[test]
fn zero_bound_makes_the_quantifier_non_executable() {
    let case = run_det_bounded(quantified_program(), "P", Some(0));
    assert_eq!(case.outcome(), Outcome::Nonexecutable, "report: {case}");
    match &case.failure.as_ref().expect("a failure is present").source {
        FailureSource::InfiniteDomain { var, .. } => assert_eq!(var, "i"),
        other => panic!("expected an infinite-domain failure, got {other:?}"),
    }
}

#[test]
fn forall_and_negated_exists_agree() {
    // (forall i :: 0 <= i && i < 3 ==> i + 1 > 0) <==> !(exists i :: !(...))
    let body = |v: &str| {
        ExprLoc::int_lit(0)
            .leq(ExprLoc::var(v))
            .and(ExprLoc::var(v).lt(ExprLoc::int_lit(3)))
            .implies(ExprLoc::var(v).plus(ExprLoc::int_lit(1)).gt(ExprLoc::int_lit(0)))
    };
    let forall = ExprLoc::forall(vec![IdType::new("i", Type::Int)], body("i"));
    let negated_exists = ExprLoc::exists(vec![IdType::new("j", Type::Int)], body("j").not()).not();
    let case = run_det_bounded(
        vec![procedure(
            "P",
            vec![],
            vec![],
            vec![],
            vec![],
            vec![StmtLoc::assertion(forall.eq(negated_exists))],
        )],
        "P",
        Some(16),
    );
    assert_eq!(case.outcome(), Outcome::Passed, "report: {case}");
}

// =============================================================================
// Reporting
// =============================================================================

#[test]
fn global_inputs_appear_in_the_report() {
    let case = run_det(
        vec![
            Decl::VarDecl(vec![IdTypeWhere::new("g", Type::Int)]),
            procedure(
                "P",
                vec![],
                vec![IdTypeWhere::new("r", Type::Int)],
                vec![],
                vec![],
                vec![StmtLoc::assign("r", ExprLoc::var("g"))],
            ),
        ],
        "P",
    );
    assert_eq!(case.report(false), "P() (g = 0) passed");
    let json = case.to_json();
    assert_eq!(json["outcome"], "passed");
    assert_eq!(json["global_inputs"]["g"], "0");
}
