mod test_restart;
mod test_scenarios;
