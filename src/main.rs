fn main() {
    testpool::cli::run();
}
