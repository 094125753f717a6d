mod append_challenged_tests;
mod lifecycle_tests;
mod posix_file_tests;
