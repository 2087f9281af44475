//! Disassembler output: exact listing for a fixed program, stability across
//! independent compiles, and operand decoding for closures and invokes

use cinder_runtime::Vm;

fn disassemble(source: &str) -> String {
    let mut vm = Vm::new();
    let function = vm.compile_source(source).expect("compilation failed");
    vm.disassemble_function(function)
}

#[test]
fn test_fixed_program_listing() {
    let listing = disassemble("print 1 + 2;");
    insta::assert_snapshot!(listing, @r###"
    == <script> ==
    0000    1 Constant            0 '1'
    0002    | Constant            1 '2'
    0004    | Add
    0005    | Print
    0006    | Nil
    0007    | Return
    "###);
}

#[test]
fn test_line_column_marks_continuations() {
    let listing = disassemble("print 1;\nprint 2;");
    insta::assert_snapshot!(listing, @r###"
    == <script> ==
    0000    1 Constant            0 '1'
    0002    | Print
    0003    2 Constant            1 '2'
    0005    | Print
    0006    | Nil
    0007    | Return
    "###);
}

#[test]
fn test_listing_is_stable_across_compiles() {
    let source = "fun make(x) { fun get() { return x; } return get; }\n\
                  class A { init() { this.x = 1; } get() { return this.x; } }\n\
                  var a = A(); a.get();\n\
                  for (var i = 0; i < 3; i = i + 1) print i and true or false;";
    assert_eq!(disassemble(source), disassemble(source));
}

#[test]
fn test_closure_listing_shows_upvalue_pairs() {
    let listing = disassemble("fun outer() { var x = 1; fun inner() { return x; } }");
    // inner captures outer's local slot 1.
    assert!(listing.contains("Closure"), "listing:\n{}", listing);
    assert!(listing.contains("local 1"), "listing:\n{}", listing);
}

#[test]
fn test_invoke_listing_reads_both_operands() {
    let listing = disassemble("class A { m(a, b) {} } A().m(1, 2);");
    // Name constant and argument count come from successive bytes.
    assert!(listing.contains("Invoke"), "listing:\n{}", listing);
    assert!(listing.contains("(2 args)"), "listing:\n{}", listing);
    assert!(listing.contains("'m'"), "listing:\n{}", listing);
}

#[test]
fn test_jump_listing_shows_target() {
    let listing = disassemble("if (true) print 1;");
    assert!(listing.contains("JumpIfFalse"), "listing:\n{}", listing);
    assert!(listing.contains("->"), "listing:\n{}", listing);
}
