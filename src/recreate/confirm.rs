//! Typed-name confirmation prompt.

use std::io::{BufRead, Write};

use super::RecreateError;

/// Prompts for the VM name and requires an exact match.
///
/// End of input counts as an empty answer.
pub(crate) fn confirm_by_name<I, W>(
    vm_name: &str,
    input: &mut I,
    out: &mut W,
) -> Result<(), RecreateError>
where
    I: BufRead,
    W: Write,
{
    write!(
        out,
        "This destroys the instance behind VM \"{vm_name}\"; the project volume and address are kept.\nType the VM name to confirm: "
    )
    .and_then(|()| out.flush())
    .map_err(|err| RecreateError::ConfirmationUnreadable {
        message: err.to_string(),
    })?;

    let mut line = String::new();
    input
        .read_line(&mut line)
        .map_err(|err| RecreateError::ConfirmationUnreadable {
            message: err.to_string(),
        })?;
    let answer = line.trim_end_matches(['\r', '\n']);

    if answer == vm_name {
        Ok(())
    } else {
        Err(RecreateError::Unconfirmed {
            input: answer.to_owned(),
            vm_name: vm_name.to_owned(),
        })
    }
}
