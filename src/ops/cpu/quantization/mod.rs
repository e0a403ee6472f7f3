mod aqlm;
