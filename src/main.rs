fn main() {
    gantry::run();
}
