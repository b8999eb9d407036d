//! The `tutorloop register` command.

use std::path::PathBuf;

use anyhow::Result;

use tutorloop_core::model::Student;
use tutorloop_core::repository::Repository;

pub fn execute(name: String, email: String, config_path: Option<PathBuf>) -> Result<()> {
    let name = name.trim();
    let email = email.trim().to_lowercase();
    anyhow::ensure!(!name.is_empty(), "name must not be empty");
    anyhow::ensure!(email.contains('@'), "'{email}' is not an email address");

    let config = super::load(config_path.as_deref())?;
    let repo = super::open_repository(&config)?;

    let student = Student::new(name, email);
    repo.insert_student(&student)?;

    println!("Registered {} <{}>", student.name, student.email);
    println!("Student id: {}", student.id);
    Ok(())
}
