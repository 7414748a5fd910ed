use vulnmirror::application::Application;

use std::process;

fn main() {
    let mut application = Application::new();
    application.read_argv();
    process::exit(application.run());
}
