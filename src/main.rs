fn main() {
    relay_lib::run();
}
