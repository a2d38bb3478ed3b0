mod helpers;

mod format_tests;
mod gc_tests;
